//! Smoke test: configuration file, seeded store and coordinator wired the way
//! the binary wires them

mod common;

use serverset_discovery::member::encode;
use serverset_discovery::{CreateMode, DiscoveryCoordinator, MemoryStore, ServersetMember};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread")]
async fn test_seeded_discovery_end_to_end() {
    let config = common::load_config();
    config.validate().expect("fixture config is valid");
    assert_eq!(config.serverset.ensemble().to_string(), "zk1.example.com:2181,zk2.example.com:2181");

    let store = MemoryStore::new();
    let seeded = store
        .seed_from_yaml(&common::load_seed(), &config.serverset.member_prefix)
        .expect("Failed to seed store");
    assert_eq!(seeded, 3);

    let coordinator =
        DiscoveryCoordinator::new(config.serverset.clone(), Arc::new(store.clone())).unwrap();
    let (tx, rx) = async_channel::bounded(config.serverset.queue_depth);
    let done = CancellationToken::new();
    let handle = coordinator.start(tx, done.clone()).unwrap();

    let groups = common::collect_until(
        &rx,
        &[
            ("/aurora/prod/web", &["10.0.0.1:8080", "10.0.0.2:8080"]),
            ("/aurora/prod/api", &["10.0.1.1:9000"]),
        ],
    )
    .await;

    let web = &groups[0];
    let first = &web.targets[0];
    assert_eq!(first["__meta_serverset_endpoint_port_http_admin"], "9990");
    assert_eq!(first["__meta_serverset_status"], "ALIVE");
    assert_eq!(first["__meta_serverset_shard"], "0");
    assert!(first["__meta_serverset_path"].starts_with("/aurora/prod/web/member_"));

    let api = &groups[1];
    assert_eq!(api.targets[0]["__meta_serverset_status"], "WARNING");
    assert_eq!(coordinator.sources(), vec!["/aurora/prod/api", "/aurora/prod/web"]);

    // Target groups serialize to the JSON lines the binary prints
    let line = serde_json::to_string(web).unwrap();
    assert!(line.starts_with(r#"{"source":"/aurora/prod/web","targets":["#));

    done.cancel();
    tokio_test::assert_ok!(handle.await.unwrap());
    assert!(!coordinator.is_running());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_expiry_and_reregistration() {
    let config = common::load_config();
    let store = MemoryStore::new();
    store
        .seed_from_yaml(&common::load_seed(), &config.serverset.member_prefix)
        .unwrap();

    let coordinator =
        DiscoveryCoordinator::new(config.serverset.clone(), Arc::new(store.clone())).unwrap();
    let (tx, rx) = async_channel::bounded(config.serverset.queue_depth);
    let handle = coordinator.start(tx, CancellationToken::new()).unwrap();

    common::collect_until(&rx, &[("/aurora/prod/web", &["10.0.0.1:8080", "10.0.0.2:8080"])]).await;

    // every member's session ends, then one service registers again
    store.expire_ephemerals();
    common::collect_until(&rx, &[("/aurora/prod/web", &[]), ("/aurora/prod/api", &[])]).await;

    let member = ServersetMember::new("10.0.0.3", 8080);
    store
        .create(
            "/aurora/prod/web/member_",
            &encode(&member).unwrap(),
            CreateMode::EphemeralSequential,
        )
        .unwrap();
    common::collect_until(&rx, &[("/aurora/prod/web", &["10.0.0.3:8080"])]).await;

    coordinator.stop();
    tokio_test::assert_ok!(handle.await.unwrap());
}
