//! Per-consumer processing policy resolution.
//!
//! Batch size and wait time resolve from a per-consumer override, then the
//! global defaults, then hard defaults (available parallelism and one
//! second). Invalid zero values never survive resolution. Resolution happens
//! once per subscription, when the behavior is constructed.

use std::{collections::HashMap, time::Duration};

const DEFAULT_WAIT_TIME: Duration = Duration::from_millis(1000);

/// Consumption policy configuration for a set of subscriptions.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Default batch size when no override applies. Falls back to the number
    /// of available CPUs.
    pub default_batch_size: Option<usize>,
    /// Default wait time before a partial batch is flushed. Falls back to one
    /// second.
    pub default_wait_time: Option<Duration>,
    /// Requeue messages that fail on their first delivery.
    pub requeue_on_error: bool,
    /// Never reject without requeue: leave messages unacknowledged instead of
    /// discarding them.
    pub never_discard: bool,
    /// Per-consumer overrides, keyed by the consumer name reported by its
    /// provider.
    pub overrides: HashMap<String, PolicyOverride>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_batch_size: None,
            default_wait_time: None,
            requeue_on_error: true,
            never_discard: false,
            overrides: HashMap::new(),
        }
    }
}

impl PolicyConfig {
    /// Register a per-consumer override, keyed by the consumer name reported
    /// by its provider.
    pub fn with_override(mut self, consumer: impl Into<String>, overrides: PolicyOverride) -> Self {
        self.overrides.insert(consumer.into(), overrides);
        self
    }

    /// Resolve the effective policy for one consumer.
    ///
    /// Zero-valued overrides count as unset, and a zero value that survives
    /// the fallback chain is clamped to the hard default.
    pub fn resolve(&self, consumer: &str) -> ResolvedPolicy {
        let overrides = self.overrides.get(consumer);

        let batch_size = overrides
            .and_then(|o| o.batch_size)
            .filter(|size| *size > 0)
            .or(self.default_batch_size)
            .unwrap_or_else(num_cpus::get)
            .max(1);

        let wait_time = overrides
            .and_then(|o| o.wait_time)
            .filter(|wait| !wait.is_zero())
            .or(self.default_wait_time)
            .unwrap_or(DEFAULT_WAIT_TIME);
        let wait_time = if wait_time.is_zero() {
            DEFAULT_WAIT_TIME
        } else {
            wait_time
        };

        ResolvedPolicy {
            batch_size,
            wait_time,
            requeue_on_error: self.requeue_on_error,
            never_discard: self.never_discard,
        }
    }
}

/// Per-consumer policy override.
#[derive(Debug, Clone, Default)]
pub struct PolicyOverride {
    /// Batch size for this consumer.
    pub batch_size: Option<usize>,
    /// Wait time for this consumer.
    pub wait_time: Option<Duration>,
}

/// Policy resolved for one consumer at subscription setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy {
    /// Batch size for the batch strategy; concurrency capacity for the
    /// single-message strategy.
    pub batch_size: usize,
    /// Maximum time a buffered message waits before a flush is forced.
    pub wait_time: Duration,
    /// Requeue messages that fail on their first delivery.
    pub requeue_on_error: bool,
    /// Leave non-requeueable failures unacknowledged instead of discarding.
    pub never_discard: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_defaults_apply_without_configuration() {
        let config = PolicyConfig::default();

        let policy = config.resolve("orders");

        assert_eq!(policy.batch_size, num_cpus::get().max(1));
        assert_eq!(policy.wait_time, Duration::from_millis(1000));
        assert!(policy.requeue_on_error);
        assert!(!policy.never_discard);
    }

    #[test]
    fn override_wins_over_global_default() {
        let config = PolicyConfig {
            default_batch_size: Some(8),
            default_wait_time: Some(Duration::from_millis(250)),
            ..PolicyConfig::default()
        }
        .with_override(
            "orders",
            PolicyOverride {
                batch_size: Some(3),
                wait_time: Some(Duration::from_millis(50)),
            },
        );

        let policy = config.resolve("orders");
        assert_eq!(policy.batch_size, 3);
        assert_eq!(policy.wait_time, Duration::from_millis(50));

        let other = config.resolve("invoices");
        assert_eq!(other.batch_size, 8);
        assert_eq!(other.wait_time, Duration::from_millis(250));
    }

    #[test]
    fn zero_override_counts_as_unset() {
        let config = PolicyConfig {
            default_batch_size: Some(5),
            ..PolicyConfig::default()
        }
        .with_override(
            "orders",
            PolicyOverride {
                batch_size: Some(0),
                wait_time: Some(Duration::ZERO),
            },
        );

        let policy = config.resolve("orders");
        assert_eq!(policy.batch_size, 5);
        assert_eq!(policy.wait_time, Duration::from_millis(1000));
    }

    #[test]
    fn zero_global_defaults_are_clamped() {
        let config = PolicyConfig {
            default_batch_size: Some(0),
            default_wait_time: Some(Duration::ZERO),
            ..PolicyConfig::default()
        };

        let policy = config.resolve("orders");
        assert_eq!(policy.batch_size, 1);
        assert_eq!(policy.wait_time, Duration::from_millis(1000));
    }
}
