use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EmblemError, EmblemResult};
use crate::review::{CritiqueKind, Thresholds};

/// Top-level configuration, usually read from `emblem.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmblemConfig {
    /// Job state machine settings.
    #[serde(default)]
    pub planner: PlannerConfig,
    /// Score fusion settings.
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    /// Queue settings.
    #[serde(default)]
    pub bus: BusConfig,
}

impl EmblemConfig {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> EmblemResult<()> {
        if self.planner.max_rounds == 0 {
            return Err(EmblemError::Config("planner.max_rounds must be at least 1".into()));
        }
        if self.planner.required_timeout_secs == 0 || self.planner.optional_timeout_secs == 0 {
            return Err(EmblemError::Config("planner timeouts must be non-zero".into()));
        }
        if self.planner.job_ttl_secs == Some(0) {
            return Err(EmblemError::Config("planner.job_ttl_secs must be non-zero".into()));
        }
        if self.arbiter.required_kinds.is_empty() {
            return Err(EmblemError::Config("arbiter.required_kinds must not be empty".into()));
        }
        let t = &self.arbiter.thresholds;
        for (name, value) in [
            ("clarity", t.clarity),
            ("aesthetic", t.aesthetic),
            ("recognizability", t.recognizability),
            ("max_structure_penalty", t.max_structure_penalty),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(EmblemError::Config(format!(
                    "arbiter.thresholds.{name} must be within 0..=100, got {value}"
                )));
            }
        }
        if self.bus.queue_capacity == Some(0) {
            return Err(EmblemError::Config("bus.queue_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

/// Planner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Rounds after which finalization is forced.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Timeout for mandatory replies.
    #[serde(default = "default_required_timeout")]
    pub required_timeout_secs: u64,
    /// Timeout for the optional detection reply.
    #[serde(default = "default_optional_timeout")]
    pub optional_timeout_secs: u64,
    /// Jobs older than this are reaped. Disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ttl_secs: Option<u64>,
    /// Schema sent with detection requests.
    #[serde(default = "default_detection_schema")]
    pub detection_schema: String,
    /// Tracing method sent with vectorization requests.
    #[serde(default = "default_vectorize_method")]
    pub vectorize_method: String,
    /// Simplification tolerance sent with vectorization requests.
    #[serde(default = "default_simplify_eps")]
    pub simplify_eps: f64,
}

fn default_max_rounds() -> u32 {
    3
}
fn default_required_timeout() -> u64 {
    30
}
fn default_optional_timeout() -> u64 {
    5
}
fn default_detection_schema() -> String {
    r#"{"kind":"landmark"}"#.to_string()
}
fn default_vectorize_method() -> String {
    "auto".to_string()
}
fn default_simplify_eps() -> f64 {
    1.0
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            required_timeout_secs: default_required_timeout(),
            optional_timeout_secs: default_optional_timeout(),
            job_ttl_secs: None,
            detection_schema: default_detection_schema(),
            vectorize_method: default_vectorize_method(),
            simplify_eps: default_simplify_eps(),
        }
    }
}

impl PlannerConfig {
    /// Required join timeout.
    pub fn required_timeout(&self) -> Duration {
        Duration::from_secs(self.required_timeout_secs)
    }

    /// Optional join timeout.
    pub fn optional_timeout(&self) -> Duration {
        Duration::from_secs(self.optional_timeout_secs)
    }

    /// Reaper TTL, if enabled.
    pub fn job_ttl(&self) -> Option<Duration> {
        self.job_ttl_secs.map(Duration::from_secs)
    }
}

/// Arbiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Critique kinds that must all arrive before a decision.
    #[serde(default = "default_required_kinds")]
    pub required_kinds: Vec<CritiqueKind>,
    /// Decision thresholds.
    #[serde(default)]
    pub thresholds: Thresholds,
}

fn default_required_kinds() -> Vec<CritiqueKind> {
    vec![CritiqueKind::structure(), CritiqueKind::aesthetic()]
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            required_kinds: default_required_kinds(),
            thresholds: Thresholds::default(),
        }
    }
}

/// What a bounded topic queue does when full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Discard the message being published.
    DropNewest,
}

/// Bus settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-topic queue bound. Unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    /// Policy applied when a bounded queue is full.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}
