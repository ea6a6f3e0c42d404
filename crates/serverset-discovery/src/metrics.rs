//! Discovery metrics
//!
//! Counters are kept locally for inspection and mirrored to the `metrics`
//! facade, labelled by source root where one applies.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics shared by the coordinator and its tree watchers.
#[derive(Debug)]
pub struct DiscoveryMetrics {
    watch_events: AtomicU64,
    store_failures: AtomicU64,
    malformed_members: AtomicU64,
    target_groups: AtomicU64,
}

impl DiscoveryMetrics {
    pub fn new() -> Self {
        describe_counter!(
            "serverset_sd_watch_events_total",
            "Watch notifications received from the coordination store"
        );
        describe_counter!(
            "serverset_sd_store_failures_total",
            "Failed store calls and dropped watches"
        );
        describe_counter!(
            "serverset_sd_malformed_members_total",
            "Member payloads that failed to decode"
        );
        describe_counter!(
            "serverset_sd_target_groups_total",
            "Target groups delivered to the consumer"
        );
        describe_gauge!("serverset_sd_sources", "Configured roots that currently exist");

        Self {
            watch_events: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            malformed_members: AtomicU64::new(0),
            target_groups: AtomicU64::new(0),
        }
    }

    pub fn record_watch_event(&self, root: &str) {
        self.watch_events.fetch_add(1, Ordering::Relaxed);
        counter!("serverset_sd_watch_events_total", "source" => root.to_string()).increment(1);
    }

    pub fn record_store_failure(&self, root: &str) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        counter!("serverset_sd_store_failures_total", "source" => root.to_string()).increment(1);
    }

    pub fn record_malformed_member(&self, root: &str) {
        self.malformed_members.fetch_add(1, Ordering::Relaxed);
        counter!("serverset_sd_malformed_members_total", "source" => root.to_string())
            .increment(1);
    }

    pub fn record_target_group(&self, root: &str) {
        self.target_groups.fetch_add(1, Ordering::Relaxed);
        counter!("serverset_sd_target_groups_total", "source" => root.to_string()).increment(1);
    }

    pub fn set_sources(&self, count: usize) {
        gauge!("serverset_sd_sources").set(count as f64);
    }

    pub fn watch_events(&self) -> u64 {
        self.watch_events.load(Ordering::Relaxed)
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn malformed_members(&self) -> u64 {
        self.malformed_members.load(Ordering::Relaxed)
    }

    pub fn target_groups(&self) -> u64 {
        self.target_groups.load(Ordering::Relaxed)
    }
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}
