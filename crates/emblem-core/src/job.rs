use serde::{Deserialize, Serialize};

/// Where a job's state machine currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Waiting for grounding, inference and (optionally) detection.
    AwaitingGroundSpec,
    /// Waiting for the merged structural spec.
    AwaitingMerge,
    /// Waiting for a style descriptor.
    AwaitingDesign,
    /// Waiting for generated candidates.
    AwaitingGenerate,
    /// Waiting for the arbiter's fused decision.
    AwaitingReviews,
    /// Another round was requested.
    Refining,
    /// Vectorizing the best candidate.
    Finalizing,
    /// Completion emitted.
    Done,
    /// Stopped without completion (timeout or reaped).
    Aborted,
}

impl JobPhase {
    /// Whether the job can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::Aborted)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobPhase::AwaitingGroundSpec => "awaiting_ground_spec",
            JobPhase::AwaitingMerge => "awaiting_merge",
            JobPhase::AwaitingDesign => "awaiting_design",
            JobPhase::AwaitingGenerate => "awaiting_generate",
            JobPhase::AwaitingReviews => "awaiting_reviews",
            JobPhase::Refining => "refining",
            JobPhase::Finalizing => "finalizing",
            JobPhase::Done => "done",
            JobPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// How a completed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The arbiter decided `stop`.
    Converged,
    /// The round budget ran out while the arbiter still asked to refine.
    Exhausted,
}
