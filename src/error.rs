//! Error types shared by provisioning, validation and teardown

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("unexpected number of {what}: {count}")]
    UnexpectedCount { what: String, count: usize },

    #[error("no client pod available")]
    NoClientPod,

    #[error("timeout reached waiting for {what} (last error: {source})")]
    DeadlineExceeded {
        what: String,
        #[source]
        source: Box<Error>,
    },

    #[error("waiting for {what} was cancelled (last error: {source})")]
    Cancelled {
        what: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Interrupted(String),

    #[error("command {command:?} in pod {namespace}/{pod} failed: {message}")]
    Exec {
        namespace: String,
        pod: String,
        command: Vec<String>,
        message: String,
        stdout: String,
    },

    #[error("{0}")]
    NotReady(String),

    #[error("{0}")]
    Validation(String),

    #[error("failed to unmarshal ipcache dump: {0}")]
    IpCache(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Map a raw kube error for a named object onto the not-found /
    /// already-exists variants callers match on.
    pub fn from_kube(kind: &'static str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(e) if e.code == 404 => Error::not_found(kind, name),
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => {
                Error::already_exists(kind, name)
            }
            _ => Error::Kube(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409 && e.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Whether a polling loop may retry after this error.
    ///
    /// Probe failures and objects that have not converged yet are retryable.
    /// Structural violations (wrong pod counts, no client pod) and API
    /// rejections such as permission or validation errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NotFound { .. }
            | Error::Exec { .. }
            | Error::NotReady(_)
            | Error::Validation(_)
            | Error::IpCache(_)
            | Error::Interrupted(_) => true,
            Error::Kube(kube::Error::Api(e)) => {
                e.code == 404 || e.code == 409 || e.code == 429 || e.code >= 500
            }
            Error::Kube(_) | Error::Io(_) => true,
            Error::AlreadyExists { .. }
            | Error::UnexpectedCount { .. }
            | Error::NoClientPod
            | Error::DeadlineExceeded { .. }
            | Error::Cancelled { .. }
            | Error::Config(_)
            | Error::Yaml(_) => false,
        }
    }

    /// Whether this error came from the waiting context rather than a probe.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}
