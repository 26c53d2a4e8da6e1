//! # Prometheus Metrics
//!
//! Operational counters for the trie database. Every [`crate::Database`]
//! owns one [`Metrics`] instance with its own [`prometheus::Registry`], so
//! two databases in one process never collide and tests can assert on
//! exact values.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Metric handles shared by the facade, the preimage store and the active
/// backend.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Preimage flushes that actually wrote to disk.
    pub preimage_flushes_total: IntCounter,
    /// Preimage bytes written to disk.
    pub preimage_bytes_flushed_total: IntCounter,
    /// Dirty nodes written to disk by `cap` (hash scheme).
    pub hash_flush_nodes_total: IntCounter,
    /// Dirty nodes written to disk by `commit` (hash scheme).
    pub hash_commit_nodes_total: IntCounter,
    /// Dirty nodes garbage collected by `dereference` (hash scheme).
    pub hash_gc_nodes_total: IntCounter,
    /// Live diff layers above the disk layer (path scheme).
    pub path_diff_layers: IntGauge,
    /// State histories written (path scheme).
    pub path_history_writes_total: IntCounter,
    /// Node buffer flushes to disk (path scheme).
    pub path_buffer_flushes_total: IntCounter,
    /// Successful `Database::commit` calls.
    pub commits_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("metric creation");
    registry
        .register(Box::new(c.clone()))
        .expect("metric registration");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("metric creation");
    registry
        .register(Box::new(g.clone()))
        .expect("metric registration");
    g
}

impl Metrics {
    /// Create and register all metrics under the `triedb` namespace.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("triedb".into()), None)
            .expect("failed to create prometheus registry");

        Self {
            preimage_flushes_total: counter(
                &registry,
                "preimage_flushes_total",
                "Preimage flushes that wrote to disk",
            ),
            preimage_bytes_flushed_total: counter(
                &registry,
                "preimage_bytes_flushed_total",
                "Preimage bytes written to disk",
            ),
            hash_flush_nodes_total: counter(
                &registry,
                "hash_flush_nodes_total",
                "Dirty trie nodes flushed by cap",
            ),
            hash_commit_nodes_total: counter(
                &registry,
                "hash_commit_nodes_total",
                "Dirty trie nodes persisted by commit",
            ),
            hash_gc_nodes_total: counter(
                &registry,
                "hash_gc_nodes_total",
                "Dirty trie nodes garbage collected",
            ),
            path_diff_layers: gauge(
                &registry,
                "path_diff_layers",
                "Diff layers held above the disk layer",
            ),
            path_history_writes_total: counter(
                &registry,
                "path_history_writes_total",
                "State histories written",
            ),
            path_buffer_flushes_total: counter(
                &registry,
                "path_buffer_flushes_total",
                "Node buffer flushes to disk",
            ),
            commits_total: counter(&registry, "commits_total", "Completed database commits"),
            registry,
        }
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_namespace() {
        let metrics = Metrics::new();
        metrics.commits_total.inc();
        let text = metrics.encode();
        assert!(text.contains("triedb_commits_total 1"));
    }

    #[test]
    fn instances_are_independent() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.hash_gc_nodes_total.inc_by(3);
        assert_eq!(a.hash_gc_nodes_total.get(), 3);
        assert_eq!(b.hash_gc_nodes_total.get(), 0);
    }
}
