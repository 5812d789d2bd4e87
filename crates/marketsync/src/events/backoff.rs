//! Retry delay policies for queued events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::listeners::pattern_matches;

/// Computes the delay before retry number `attempts` (1-based).
pub trait BackoffPolicy: Send + Sync + std::fmt::Debug {
    fn delay(&self, attempts: u32) -> Duration;
}

/// Built-in policies.
///
/// Deserializes from e.g. `{ strategy = "linear", step_secs = 300 }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    Constant {
        delay_secs: u64,
    },
    Linear {
        step_secs: u64,
        #[serde(default)]
        max_secs: Option<u64>,
    },
    Exponential {
        base_secs: u64,
        #[serde(default = "default_factor")]
        factor: u32,
        max_secs: u64,
    },
}

fn default_factor() -> u32 {
    2
}

impl Default for Backoff {
    /// Five minutes per attempt.
    fn default() -> Self {
        Backoff::Linear {
            step_secs: 300,
            max_secs: None,
        }
    }
}

impl BackoffPolicy for Backoff {
    fn delay(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        match *self {
            Backoff::Constant { delay_secs } => Duration::from_secs(delay_secs),
            Backoff::Linear {
                step_secs,
                max_secs,
            } => {
                let secs = step_secs.saturating_mul(u64::from(attempts));
                Duration::from_secs(max_secs.map_or(secs, |cap| secs.min(cap)))
            }
            Backoff::Exponential {
                base_secs,
                factor,
                max_secs,
            } => {
                let growth = u64::from(factor.max(1)).saturating_pow(attempts - 1);
                Duration::from_secs(base_secs.saturating_mul(growth).min(max_secs))
            }
        }
    }
}

/// Default policy plus per-event overrides.
///
/// Override keys use listener patterns: an exact name, `prefix.*`, or `*`.
#[derive(Debug, Clone)]
pub struct BackoffTable {
    default: Arc<dyn BackoffPolicy>,
    overrides: HashMap<String, Arc<dyn BackoffPolicy>>,
}

impl Default for BackoffTable {
    fn default() -> Self {
        Self::new(Arc::new(Backoff::default()))
    }
}

impl BackoffTable {
    pub fn new(default: Arc<dyn BackoffPolicy>) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_override(mut self, pattern: impl Into<String>, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.overrides.insert(pattern.into(), policy);
        self
    }

    /// Policy for `event_name`; an exact override beats the longest matching pattern.
    pub fn policy_for(&self, event_name: &str) -> &dyn BackoffPolicy {
        if let Some(policy) = self.overrides.get(event_name) {
            return policy.as_ref();
        }
        self.overrides
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, event_name))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, policy)| policy.as_ref())
            .unwrap_or(self.default.as_ref())
    }

    pub fn delay(&self, event_name: &str, attempts: u32) -> Duration {
        self.policy_for(event_name).delay(attempts)
    }
}
