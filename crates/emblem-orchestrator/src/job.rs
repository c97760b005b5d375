use emblem_core::{EmblemError, EmblemResult, JobPhase};
use serde_json::Value;

/// Working state of one job, owned by the task driving it.
#[derive(Debug, Clone)]
pub struct JobState {
    /// Job identifier.
    pub job_id: String,
    /// Original request text.
    pub user_text: String,
    /// Optional reference image.
    pub image_path: Option<String>,
    phase: JobPhase,
    round: u32,
    /// Merged structural spec.
    pub spec: Value,
    /// Detector output, `{}` when absent or timed out.
    pub detector_spec: Value,
    /// Style of the current round.
    pub style_json: Option<String>,
    /// Best candidate of the current round.
    pub best_png: Option<String>,
}

impl JobState {
    /// Fresh state at round 1, waiting for the ground specs.
    pub fn new(
        job_id: impl Into<String>,
        user_text: impl Into<String>,
        image_path: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            user_text: user_text.into(),
            image_path,
            phase: JobPhase::AwaitingGroundSpec,
            round: 1,
            spec: Value::Object(Default::default()),
            detector_spec: Value::Object(Default::default()),
            style_json: None,
            best_png: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Current round, starting at 1.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Move to `to`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, to: JobPhase) -> EmblemResult<()> {
        if !Self::allowed(self.phase, to) {
            return Err(EmblemError::Agent(format!(
                "job {}: invalid transition {} -> {}",
                self.job_id, self.phase, to
            )));
        }
        self.phase = to;
        Ok(())
    }

    /// Start another refinement round.
    pub fn begin_refinement(&mut self) -> EmblemResult<u32> {
        self.transition(JobPhase::Refining)?;
        self.round = self.round.saturating_add(1);
        Ok(self.round)
    }

    /// Whether the round budget is spent.
    pub fn budget_exhausted(&self, max_rounds: u32) -> bool {
        self.round >= max_rounds
    }

    fn allowed(from: JobPhase, to: JobPhase) -> bool {
        use JobPhase::*;
        match (from, to) {
            (from, Aborted) => !from.is_terminal(),
            (AwaitingGroundSpec, AwaitingMerge)
            | (AwaitingMerge, AwaitingDesign)
            | (AwaitingDesign, AwaitingGenerate)
            | (AwaitingGenerate, AwaitingReviews)
            | (AwaitingReviews, Refining)
            | (AwaitingReviews, Finalizing)
            | (Refining, AwaitingDesign)
            | (Finalizing, Done) => true,
            _ => false,
        }
    }
}
