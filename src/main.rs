use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conncheck::{
    config::Config,
    convergence::WaitContext,
    k8s::{render, ClusterApi, ClusterClients, K8sClient},
    models::FeatureSet,
    topology,
};

fn init_tracing(format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_format);
    tracing::info!(namespace = %config.test_namespace, "Configuration loaded");

    let features = FeatureSet::from_overrides(&config.features);

    if config.dry_run {
        let plan = topology::plan(&config, &features, "");
        print!("{}", render(&plan, &config.test_namespace)?);
        return Ok(());
    }

    let src: Arc<dyn ClusterApi> =
        Arc::new(K8sClient::connect(config.kube_context.as_deref()).await?);
    let clients = if config.is_multi_cluster() {
        let dst: Arc<dyn ClusterApi> =
            Arc::new(K8sClient::connect(Some(&config.multi_cluster)).await?);
        ClusterClients::multi(src, dst)
    } else {
        ClusterClients::single(src)
    };

    let ctx = WaitContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling outstanding waits");
            canceller.cancel();
        }
    });

    let inventory = conncheck::run(&ctx, clients, config, features).await?;

    tracing::info!(
        run_id = %inventory.run_id,
        elapsed_secs = (chrono::Utc::now() - inventory.started_at).num_seconds(),
        "Connectivity check finished"
    );
    Ok(())
}
