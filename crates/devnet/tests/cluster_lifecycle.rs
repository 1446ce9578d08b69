//! Integration tests for the cluster lifecycle against a recording mock engine.

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use common::{Event, MockEngine, Op, operation_failed, unreachable};
use devnet::container::ContainerState;
use devnet::{Cluster, ClusterConfig, ClusterPhase, ImageCatalog};
use devnet_common::{DevnetError, ResourceName};
use tokio_util::sync::CancellationToken;

fn devnet(name: &str, include_faucet: bool) -> ClusterConfig {
    ImageCatalog::default().devnet_config(ResourceName::new(name).unwrap(), include_faucet)
}

fn make(engine: &MockEngine, config: &ClusterConfig) -> Cluster {
    Cluster::make(config, &ImageCatalog::default(), engine.backend()).unwrap()
}

#[test_log::test(tokio::test)]
async fn dependencies_are_healthy_before_dependents_start() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    let cluster = make(&engine, &devnet("order", true));

    cluster.start(&CancellationToken::new()).await?;

    for service in cluster.spec().services() {
        let created = engine
            .position(&Event::Create(format!("order-{}", service.name)))
            .unwrap();
        for dependency in &service.depends_on {
            let ready = engine.position(&Event::Ready(dependency.to_string())).unwrap();
            assert!(
                ready < created,
                "{} created before {dependency} was healthy",
                service.name
            );
        }
    }

    let order: Vec<_> = cluster
        .handles()
        .iter()
        .map(|handle| handle.service.name.to_string())
        .collect();
    insta::assert_debug_snapshot!(order, @r#"
    [
        "node",
        "indexer",
        "proof-server",
        "faucet",
    ]
    "#);

    cluster.remove().await?;
    Ok(())
}

#[tokio::test]
async fn node_indexer_proof_server_without_faucet() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    let cluster = make(&engine, &devnet("trio", false));

    let endpoints = cluster.start(&CancellationToken::new()).await?;

    assert_eq!(cluster.phase(), ClusterPhase::Started);
    assert_eq!(engine.events()[0], Event::CreateNetwork("trio-net".to_string()));
    assert_eq!(endpoints.node_uri.as_deref(), Some("http://127.0.0.1:9944"));
    assert_eq!(
        endpoints.indexer_uri.as_deref(),
        Some("http://127.0.0.1:8088/api/v1/graphql")
    );
    assert_eq!(
        endpoints.indexer_ws_uri.as_deref(),
        Some("ws://127.0.0.1:8088/api/v1/graphql/ws")
    );
    assert_eq!(endpoints.proof_server_uri.as_deref(), Some("http://127.0.0.1:6300"));
    assert_eq!(endpoints.faucet_uri, None);
    assert_eq!(endpoints.network_id, "undeployed");
    assert_eq!(cluster.network_config()?, endpoints);
    assert!(
        cluster
            .handles()
            .iter()
            .all(|handle| handle.state == ContainerState::Healthy)
    );

    let json = serde_json::to_value(&endpoints)?;
    assert!(json.get("faucetUri").is_none());

    cluster.remove().await?;
    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
    Ok(())
}

#[test_log::test(tokio::test(start_paused = true))]
async fn health_timeout_rolls_back_everything() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    engine.never_healthy("indexer");
    let mut config = devnet("timeout", false);
    config.health.timeout = Duration::from_secs(5);
    let cluster = make(&engine, &config);

    let err = cluster.start(&CancellationToken::new()).await.unwrap_err();

    match &err {
        DevnetError::StartupFailed {
            service,
            cause,
            rollback,
        } => {
            assert_eq!(service, "indexer");
            assert!(rollback.is_empty());
            assert!(matches!(**cause, DevnetError::HealthTimeout { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    // proof-server comes after indexer and is never created
    assert_eq!(engine.position(&Event::Create("timeout-proof-server".to_string())), None);
    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
    assert_eq!(cluster.phase(), ClusterPhase::Removed);

    // Reverse creation order: the failing container first, then its dependency
    let teardown: Vec<_> = engine
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::Remove(_) | Event::RemoveNetwork(_)))
        .collect();
    assert_eq!(
        teardown,
        [
            Event::Remove("timeout-indexer".to_string()),
            Event::Remove("timeout-node".to_string()),
            Event::RemoveNetwork("timeout-net".to_string()),
        ]
    );

    // Cleanup is idempotent
    cluster.remove().await?;
    assert!(matches!(
        cluster.network_config(),
        Err(DevnetError::InvalidState { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn remove_on_never_started_cluster_is_trivial() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    let cluster = make(&engine, &devnet("idle", false));

    cluster.remove().await?;

    assert_eq!(engine.calls(), 0);
    assert_eq!(cluster.phase(), ClusterPhase::Removed);
    Ok(())
}

#[tokio::test]
async fn remove_twice_succeeds() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    let cluster = make(&engine, &devnet("twice", false));
    cluster.start(&CancellationToken::new()).await?;

    cluster.remove().await?;
    let events_after_first = engine.events().len();
    let calls_after_first = engine.calls();

    cluster.remove().await?;

    // The second pass re-issues removal and only sees missing resources
    assert!(engine.calls() > calls_after_first);
    assert_eq!(engine.events().len(), events_after_first);
    assert!(engine.live_containers().is_empty());
    Ok(())
}

#[tokio::test]
async fn cyclic_dependencies_rejected_without_engine_calls() {
    let yaml = r"
name: cyclic
services:
  - name: a
    image: busybox
    depends_on: [b]
  - name: b
    image: busybox
    depends_on: [a]
";
    let engine = MockEngine::new();
    let config = ClusterConfig::from_yaml(yaml).unwrap();

    let err = Cluster::make(&config, &ImageCatalog::default(), engine.backend()).unwrap_err();

    assert!(matches!(err, DevnetError::Config { .. }));
    assert_eq!(engine.calls(), 0);
}

#[test_log::test(tokio::test)]
async fn proof_server_creation_failure() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    engine.fail(Op::Create, "proof-proof-server", 1, operation_failed);
    let cluster = make(&engine, &devnet("proof", false));

    let err = cluster.start(&CancellationToken::new()).await.unwrap_err();

    match &err {
        DevnetError::StartupFailed { service, cause, .. } => {
            assert_eq!(service, "proof-server");
            assert!(matches!(**cause, DevnetError::OperationFailed { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    for removed in ["proof-indexer", "proof-node"] {
        assert!(engine.position(&Event::Remove(removed.to_string())).is_some());
    }
    assert!(
        engine.position(&Event::Remove("proof-indexer".to_string()))
            < engine.position(&Event::Remove("proof-node".to_string()))
    );
    assert!(engine.position(&Event::RemoveNetwork("proof-net".to_string())).is_some());
    assert!(engine.live_containers().is_empty());
    Ok(())
}

#[tokio::test]
async fn start_twice_is_invalid() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    let cluster = make(&engine, &devnet("restart", false));
    cluster.start(&CancellationToken::new()).await?;

    let err = cluster.start(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, DevnetError::InvalidState { .. }));
    assert_eq!(cluster.phase(), ClusterPhase::Started);

    cluster.remove().await?;
    let err = cluster.start(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, DevnetError::InvalidState { .. }));
    Ok(())
}

#[tokio::test]
async fn network_config_requires_started_cluster() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    let cluster = make(&engine, &devnet("endpoints", false));

    assert!(matches!(
        cluster.network_config(),
        Err(DevnetError::InvalidState { .. })
    ));
    cluster.start(&CancellationToken::new()).await?;
    assert!(cluster.network_config().is_ok());
    cluster.remove().await?;
    assert!(matches!(
        cluster.network_config(),
        Err(DevnetError::InvalidState { .. })
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancellation_rolls_back() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    engine.never_healthy("node");
    let cluster = make(&engine, &devnet("cancel", false));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = cluster.start(&cancel).await.unwrap_err();

    assert!(matches!(err, DevnetError::Cancelled));
    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
    assert_eq!(cluster.phase(), ClusterPhase::Removed);
    Ok(())
}

#[tokio::test]
async fn engine_unreachable_is_not_wrapped() {
    let engine = MockEngine::new();
    engine.fail(Op::Start, "unreachable-node", 1, unreachable);
    let cluster = make(&engine, &devnet("unreachable", false));

    let err = cluster.start(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, DevnetError::EngineUnreachable { .. }));
    // Rollback was still attempted
    assert!(engine.live_containers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn teardown_collects_every_failure() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    let cluster = make(&engine, &devnet("stubborn", false));
    cluster.start(&CancellationToken::new()).await?;

    engine.fail(Op::Remove, "stubborn-node", 5, operation_failed);
    engine.fail(Op::Remove, "stubborn-proof-server", 5, operation_failed);

    let err = cluster.remove().await.unwrap_err();

    match &err {
        DevnetError::TeardownFailed { errors } => assert_eq!(errors.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    // Steps after the failures still ran
    assert_eq!(engine.live_containers(), ["stubborn-node", "stubborn-proof-server"]);
    assert!(engine.live_networks().is_empty());

    let states: Vec<_> = cluster.handles().iter().map(|handle| handle.state).collect();
    assert_eq!(
        states,
        [
            ContainerState::Failed,
            ContainerState::Removed,
            ContainerState::Failed
        ]
    );

    // A later removal retries the containers left behind
    cluster.remove().await?;
    assert!(engine.live_containers().is_empty());
    assert!(
        cluster
            .handles()
            .iter()
            .all(|handle| handle.state == ContainerState::Removed)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_rollback_is_reported_and_retried() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    engine.never_healthy("indexer");
    engine.fail(Op::Remove, "leak-node", 4, operation_failed);
    let mut config = devnet("leak", false);
    config.health.timeout = Duration::from_secs(5);
    let cluster = make(&engine, &config);

    let err = cluster.start(&CancellationToken::new()).await.unwrap_err();

    match &err {
        DevnetError::StartupFailed {
            service,
            cause,
            rollback,
        } => {
            assert_eq!(service, "indexer");
            assert!(matches!(**cause, DevnetError::HealthTimeout { .. }));
            assert_eq!(rollback.len(), 1);
            assert!(matches!(rollback[0], DevnetError::OperationFailed { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("rollback left 1 step(s) failed"));
    assert_eq!(engine.live_containers(), ["leak-node"]);
    assert_eq!(cluster.phase(), ClusterPhase::Removed);
    let node = &cluster.handles()[0];
    assert_eq!(node.state, ContainerState::Failed);

    cluster.remove().await?;
    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_slow_create() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    engine.slow_create("slowpull-indexer", Duration::from_secs(3600));
    let cluster = make(&engine, &devnet("slowpull", false));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = cluster.start(&cancel).await.unwrap_err();

    assert!(matches!(err, DevnetError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.position(&Event::Create("slowpull-indexer".to_string())), None);
    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
    assert_eq!(cluster.phase(), ClusterPhase::Removed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn teardown_retries_transient_failures() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    let cluster = make(&engine, &devnet("flaky", false));
    cluster.start(&CancellationToken::new()).await?;

    engine.fail(Op::Remove, "flaky-indexer", 2, operation_failed);
    engine.fail(Op::RemoveNetwork, "flaky-net", 1, operation_failed);

    cluster.remove().await?;
    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
    Ok(())
}

#[tokio::test]
async fn same_name_clusters_are_rejected() {
    let engine = MockEngine::new();
    let config = devnet("shared-name", false);
    let first = make(&engine, &config);

    let err = Cluster::make(&config, &ImageCatalog::default(), engine.backend()).unwrap_err();
    assert!(matches!(err, DevnetError::Config { .. }));

    drop(first);
    assert!(Cluster::make(&config, &ImageCatalog::default(), engine.backend()).is_ok());
}

#[tokio::test]
async fn existing_network_is_a_configuration_error() {
    let engine = MockEngine::new();
    engine.preexisting_network("taken-net");
    let cluster = make(&engine, &devnet("taken", false));

    let err = cluster.start(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, DevnetError::Config { .. }));
    assert!(engine.live_containers().is_empty());
    assert_eq!(engine.live_networks(), ["taken-net"]);
}

#[tokio::test(start_paused = true)]
async fn one_lifecycle_operation_at_a_time() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    engine.never_healthy("node");
    let cluster = Arc::new(make(&engine, &devnet("busy", false)));

    let cancel = CancellationToken::new();
    let starting = tokio::spawn({
        let cluster = Arc::clone(&cluster);
        let cancel = cancel.clone();
        async move { cluster.start(&cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.phase(), ClusterPhase::Starting);
    assert!(matches!(
        cluster.remove().await,
        Err(DevnetError::InvalidState { .. })
    ));

    cancel.cancel();
    assert!(matches!(starting.await?, Err(DevnetError::Cancelled)));
    assert!(engine.live_containers().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn interrupted_start_is_swept_by_remove() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    engine.never_healthy("indexer");
    let cluster = make(&engine, &devnet("dropped", false));

    let cancel = CancellationToken::new();
    let outcome = tokio::time::timeout(Duration::from_secs(1), cluster.start(&cancel)).await;
    assert!(outcome.is_err());
    assert_eq!(cluster.phase(), ClusterPhase::Interrupted);
    assert!(!engine.live_containers().is_empty());

    assert!(matches!(
        cluster.start(&cancel).await,
        Err(DevnetError::InvalidState { .. })
    ));

    cluster.remove().await?;
    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
    assert_eq!(cluster.phase(), ClusterPhase::Removed);
    Ok(())
}

#[tokio::test]
async fn leftovers_from_another_process_are_removed() -> Result<(), Box<dyn Error>> {
    let engine = MockEngine::new();
    {
        let previous = make(&engine, &devnet("leftover", false));
        previous.start(&CancellationToken::new()).await?;
        // Detached: dropped without remove
    }
    assert_eq!(engine.live_containers().len(), 3);

    let cluster = make(&engine, &devnet("leftover", false));
    cluster.remove_leftovers().await?;

    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
    Ok(())
}
