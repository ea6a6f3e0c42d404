//! Common test utilities and helpers for integration tests

use serverset_core::{AppConfig, TargetGroup};
use std::path::PathBuf;
use std::time::Duration;

/// Get the path to test fixtures
pub fn fixtures_dir() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir).join("tests").join("fixtures")
}

/// Load the fixture configuration
pub fn load_config() -> AppConfig {
    let path = fixtures_dir().join("config.yaml");
    AppConfig::from_file(&path)
        .unwrap_or_else(|e| panic!("Failed to load config from {:?}: {}", path, e))
}

/// Load the seed fixture as YAML text
pub fn load_seed() -> String {
    let path = fixtures_dir().join("seed.yaml");
    std::fs::read_to_string(&path)
        .unwrap_or_else(|_| panic!("Failed to read seed fixture from {:?}", path))
}

/// Receive target groups until the latest one of every listed source
/// carries exactly the expected addresses
pub async fn collect_until(
    rx: &async_channel::Receiver<TargetGroup>,
    expected: &[(&str, &[&str])],
) -> Vec<TargetGroup> {
    let mut latest: Vec<Option<TargetGroup>> = vec![None; expected.len()];

    let converged = |latest: &[Option<TargetGroup>]| {
        expected.iter().zip(latest).all(|((_, addresses), group)| {
            group.as_ref().is_some_and(|group| {
                let mut actual = group.addresses();
                actual.sort();
                actual == *addresses
            })
        })
    };

    while !converged(&latest) {
        let group = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("Timed out waiting for target groups")
            .expect("Target group channel closed");
        if let Some(idx) = expected.iter().position(|(source, _)| *source == group.source) {
            latest[idx] = Some(group);
        }
    }

    latest.into_iter().flatten().collect()
}
