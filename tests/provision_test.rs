mod common;

use std::sync::Arc;

use common::FakeCluster;
use conncheck::config::Config;
use conncheck::convergence::WaitContext;
use conncheck::k8s::{ClusterClients, Provisioner};
use conncheck::models::{Feature, FeatureSet, Inventory, COREDNS_CONFIG_MAP_NAME};

#[tokio::test]
async fn test_deploy_creates_default_topology() {
    let fake = Arc::new(FakeCluster::new("kind-kind"));
    let provisioner = Provisioner::new(
        ClusterClients::single(fake.clone()),
        Config::default(),
        FeatureSet::new(),
    );
    let mut inventory = Inventory::new();

    let topology = provisioner
        .deploy(&WaitContext::new(), &mut inventory)
        .await
        .unwrap();

    assert!(fake.has_namespace("cilium-test"));
    assert!(fake.has_config_map("cilium-test", COREDNS_CONFIG_MAP_NAME));
    assert_eq!(
        fake.deployment_names("cilium-test"),
        vec!["client", "client2", "echo-other-node", "echo-same-node"]
    );
    assert_eq!(
        fake.service_names("cilium-test"),
        vec!["echo-other-node", "echo-same-node"]
    );
    assert_eq!(topology.src_deployments.len(), 3);
    assert_eq!(topology.dst_deployments, vec!["echo-other-node"]);
    assert!(inventory.ingress_services.is_empty());
}

#[tokio::test]
async fn test_second_deploy_creates_nothing() {
    let fake = Arc::new(FakeCluster::new("kind-kind"));
    let provisioner = Provisioner::new(
        ClusterClients::single(fake.clone()),
        Config::default(),
        FeatureSet::new(),
    );
    let ctx = WaitContext::new();

    provisioner.deploy(&ctx, &mut Inventory::new()).await.unwrap();
    let creates = fake.creates();
    assert!(creates > 0);

    provisioner.deploy(&ctx, &mut Inventory::new()).await.unwrap();
    assert_eq!(fake.creates(), creates);
    assert_eq!(fake.deployment_names("cilium-test").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_force_deploy_recreates_topology() {
    let fake = Arc::new(FakeCluster::new("kind-kind"));
    let ctx = WaitContext::new();
    Provisioner::new(
        ClusterClients::single(fake.clone()),
        Config::default(),
        FeatureSet::new(),
    )
    .deploy(&ctx, &mut Inventory::new())
    .await
    .unwrap();
    let first = fake.creates();

    let config = Config {
        force_deploy: true,
        ..Default::default()
    };
    Provisioner::new(ClusterClients::single(fake.clone()), config, FeatureSet::new())
        .deploy(&ctx, &mut Inventory::new())
        .await
        .unwrap();

    assert_eq!(fake.creates(), first * 2);
    assert_eq!(fake.deployment_names("cilium-test").len(), 4);
}

#[tokio::test]
async fn test_ingress_records_placeholder_service() {
    let fake = Arc::new(FakeCluster::new("kind-kind"));
    let features = FeatureSet::new().with(Feature::IngressController, true);
    let provisioner = Provisioner::new(ClusterClients::single(fake.clone()), Config::default(), features);
    let mut inventory = Inventory::new();

    provisioner
        .deploy(&WaitContext::new(), &mut inventory)
        .await
        .unwrap();

    let placeholder = inventory
        .ingress_services
        .get("cilium-ingress-ingress-service")
        .unwrap();
    assert_eq!(placeholder.name(), "cilium-ingress-ingress-service");
}

#[tokio::test]
async fn test_multi_cluster_splits_topology() {
    let src = Arc::new(FakeCluster::new("cluster-1"));
    let dst = Arc::new(FakeCluster::new("cluster-2"));
    let config = Config {
        multi_cluster: "cluster-2".to_string(),
        ..Default::default()
    };
    let provisioner = Provisioner::new(
        ClusterClients::multi(src.clone(), dst.clone()),
        config,
        FeatureSet::new(),
    );

    provisioner
        .deploy(&WaitContext::new(), &mut Inventory::new())
        .await
        .unwrap();

    assert_eq!(
        src.deployment_names("cilium-test"),
        vec!["client", "client2", "echo-same-node"]
    );
    assert_eq!(dst.deployment_names("cilium-test"), vec!["echo-other-node"]);
    assert!(dst.has_namespace("cilium-test"));
    // the global echo-other-node service exists on both sides
    assert_eq!(
        src.service_names("cilium-test"),
        vec!["echo-other-node", "echo-same-node"]
    );
    assert_eq!(dst.service_names("cilium-test"), vec!["echo-other-node"]);
}

#[tokio::test]
async fn test_perf_deploy_pins_zone() {
    let fake = Arc::new(FakeCluster::new("kind-kind"));
    let config = Config {
        perf: true,
        ..Default::default()
    };
    let provisioner = Provisioner::new(ClusterClients::single(fake.clone()), config, FeatureSet::new());

    provisioner
        .deploy(&WaitContext::new(), &mut Inventory::new())
        .await
        .unwrap();

    assert_eq!(
        fake.deployment_names("cilium-test"),
        vec!["perf-client", "perf-client-other-node", "perf-server"]
    );
    let server = fake.deployment("cilium-test", "perf-server").unwrap();
    let pod_spec = server.spec.unwrap().template.spec.unwrap();
    let affinity = pod_spec.affinity.unwrap();
    let preferred = affinity
        .node_affinity
        .unwrap()
        .preferred_during_scheduling_ignored_during_execution
        .unwrap();
    let expression = &preferred[0].preference.match_expressions.as_ref().unwrap()[0];
    assert_eq!(expression.key, "topology.kubernetes.io/zone");
    assert_eq!(expression.values, Some(vec!["zone-a".to_string()]));
}
