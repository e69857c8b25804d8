//! Metrics collection and export module
//!
//! Lifecycle counters are labelled by node address and topic so one scrape
//! shows per-topic progress. A single [`Metrics`] is created at startup and
//! handed to the orchestrator explicitly.

use crate::types::{Role, TopicId};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

const LIFECYCLE_LABELS: &[&str] = &["address", "topic", "role"];

pub struct Metrics {
    registry: Registry,

    pub registrations: IntCounterVec,
    /// Labelled by value kind: inference, forecast, ground_truth, loss
    pub values_computed: IntCounterVec,
    pub bundles_built: IntCounterVec,
    pub submissions_attempted: IntCounterVec,
    pub submissions_succeeded: IntCounterVec,
    pub submissions_failed: IntCounterVec,

    pub submission_latency: Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let registrations = IntCounterVec::new(
            Opts::new(
                "offchain_registrations_total",
                "Successful registration (and stake) checks per topic",
            ),
            LIFECYCLE_LABELS,
        )?;

        let values_computed = IntCounterVec::new(
            Opts::new(
                "offchain_values_computed_total",
                "Values obtained from compute adapters",
            ),
            &["address", "topic", "kind"],
        )?;

        let bundles_built = IntCounterVec::new(
            Opts::new("offchain_bundles_built_total", "Signed bundles that passed validation"),
            LIFECYCLE_LABELS,
        )?;

        let submissions_attempted = IntCounterVec::new(
            Opts::new(
                "offchain_submissions_attempted_total",
                "Bundles handed to the submission engine",
            ),
            LIFECYCLE_LABELS,
        )?;

        let submissions_succeeded = IntCounterVec::new(
            Opts::new(
                "offchain_submissions_succeeded_total",
                "Bundles accepted by the chain",
            ),
            LIFECYCLE_LABELS,
        )?;

        let submissions_failed = IntCounterVec::new(
            Opts::new(
                "offchain_submissions_failed_total",
                "Bundles that failed permanently or exhausted retries",
            ),
            LIFECYCLE_LABELS,
        )?;

        let submission_latency = Histogram::with_opts(
            HistogramOpts::new(
                "offchain_submission_latency_seconds",
                "Time from first attempt to final outcome",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;

        registry.register(Box::new(registrations.clone()))?;
        registry.register(Box::new(values_computed.clone()))?;
        registry.register(Box::new(bundles_built.clone()))?;
        registry.register(Box::new(submissions_attempted.clone()))?;
        registry.register(Box::new(submissions_succeeded.clone()))?;
        registry.register(Box::new(submissions_failed.clone()))?;
        registry.register(Box::new(submission_latency.clone()))?;

        Ok(Self {
            registry,
            registrations,
            values_computed,
            bundles_built,
            submissions_attempted,
            submissions_succeeded,
            submissions_failed,
            submission_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bump a lifecycle counter for (address, topic, role)
    pub fn inc_lifecycle(&self, counter: &IntCounterVec, address: &str, topic_id: TopicId, role: Role) {
        let topic = topic_id.to_string();
        counter
            .with_label_values(&[address, topic.as_str(), role.as_str()])
            .inc();
    }

    pub fn inc_value_computed(&self, address: &str, topic_id: TopicId, kind: &str) {
        let topic = topic_id.to_string();
        self.values_computed
            .with_label_values(&[address, topic.as_str(), kind])
            .inc();
    }

    /// Current value of a lifecycle counter, zero if never touched
    pub fn lifecycle_count(&self, counter: &IntCounterVec, address: &str, topic_id: TopicId, role: Role) -> u64 {
        let topic = topic_id.to_string();
        counter
            .get_metric_with_label_values(&[address, topic.as_str(), role.as_str()])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counters_are_labelled() {
        let metrics = Metrics::new().unwrap();
        metrics.inc_lifecycle(&metrics.bundles_built, "allo1abc", 7, Role::Worker);
        metrics.inc_lifecycle(&metrics.bundles_built, "allo1abc", 7, Role::Worker);

        assert_eq!(
            metrics.lifecycle_count(&metrics.bundles_built, "allo1abc", 7, Role::Worker),
            2
        );
        assert_eq!(
            metrics.lifecycle_count(&metrics.bundles_built, "allo1abc", 8, Role::Worker),
            0
        );
    }

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.inc_value_computed("allo1abc", 3, "inference");
        let text = metrics.render();
        assert!(text.contains("offchain_values_computed_total"));
        assert!(text.contains("kind=\"inference\""));
    }
}
