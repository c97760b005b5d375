//! Typed payloads, one variant per topic.
//!
//! Specs produced by external workers (grounding, inference, detection,
//! merge) keep their shape as raw JSON; everything the orchestration core
//! reads itself is typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::job::{JobPhase, Outcome};
use crate::review::{CritiqueKind, CritiqueScores, Decision, FusedReview};
use crate::topic::Topic;

/// Body of a request to one of the two critics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    /// Candidate to score.
    pub image_path: String,
    /// Merged structural spec the candidate must respect.
    pub structure_spec: Value,
}

/// Fused decision published by the arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterVerdict {
    /// Stop or refine.
    pub decision: Decision,
    /// The fused review the decision was based on.
    pub review: FusedReview,
    /// Raw per-critic results that were fused.
    pub raw: BTreeMap<CritiqueKind, CritiqueScores>,
}

/// Everything that can travel on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Submit a job.
    IntentRequest {
        /// Free-form request text.
        user_text: String,
        /// Optional reference image.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_path: Option<String>,
    },
    /// Ground the request text.
    GroundingRequest {
        /// Free-form request text.
        user_text: String,
    },
    /// Grounded defaults.
    GroundingResult {
        /// Grounded spec.
        grounded: Value,
    },
    /// Infer a structural spec from text.
    StructureInferenceRequest {
        /// Free-form request text.
        user_text: String,
        /// Detector output, when already known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detector_spec: Option<Value>,
    },
    /// Inferred structural spec.
    StructureInferenceResult {
        /// Inferred spec.
        spec: Value,
    },
    /// Detect the subject in a reference image.
    DetectionRequest {
        /// Reference image.
        image_path: String,
        /// Detection schema.
        schema: String,
    },
    /// Detector output.
    DetectionResult {
        /// Detected spec.
        detector: Value,
    },
    /// Merge the partial specs.
    MergeRequest {
        /// Spec inferred from text.
        user_spec: Value,
        /// Spec detected from the image, `{}` when absent.
        detector_spec: Value,
        /// Grounded defaults.
        defaults: Value,
    },
    /// Merged spec.
    MergeResult {
        /// The single structural spec for the job.
        merged: Value,
    },
    /// Design an initial style.
    DesignRequest {
        /// Detector output, `{}` when absent.
        detector_spec: Value,
        /// Style schema.
        schema: String,
        /// Merged structural spec.
        structure_spec: Value,
        /// Best converged style remembered for the same entity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prior_style_json: Option<String>,
    },
    /// Refine a style given the last fused review.
    DesignRefineRequest {
        /// Style used in the previous round.
        prev_style_json: String,
        /// Fused review of the previous round.
        review_json: FusedReview,
        /// Merged structural spec.
        structure_spec: Value,
    },
    /// Style descriptor.
    DesignResult {
        /// Serialized style descriptor.
        style_json: String,
    },
    /// Generate candidates.
    GenerationRequest {
        /// Style to apply.
        style_json: String,
        /// Original request text.
        user_text: String,
        /// Merged structural spec.
        structure_spec: Value,
    },
    /// Generated candidates.
    GenerationResult {
        /// Every candidate produced.
        candidates: Vec<String>,
        /// The generator's pick.
        best_png: String,
        /// Generator's own quick score of the pick.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        best_review: Option<CritiqueScores>,
    },
    /// Ask the structural critic.
    StructuralReviewRequest(ReviewRequest),
    /// Ask the aesthetic critic.
    AestheticReviewRequest(ReviewRequest),
    /// One critic's scores.
    ReviewResult {
        /// Which critic.
        kind: CritiqueKind,
        /// Its scores.
        result: CritiqueScores,
    },
    /// Fused decision.
    ArbiterResult(ArbiterVerdict),
    /// Trace the best candidate.
    VectorizationRequest {
        /// Raster input.
        png_path: String,
        /// Tracing method.
        method: String,
        /// Path simplification tolerance.
        simplify_eps: f64,
    },
    /// Traced artifact; absent when tracing failed.
    VectorizationResult {
        /// Vector output.
        #[serde(default)]
        svg_path: Option<String>,
    },
    /// Terminal message of a job.
    Completion {
        /// Last fused review.
        review: FusedReview,
        /// Vector artifact, absent if vectorization failed.
        svg_path: Option<String>,
        /// Converged or exhausted.
        outcome: Outcome,
        /// Rounds run.
        rounds: u32,
    },
    /// A handler failure or job abort.
    PipelineError {
        /// Error text.
        err: String,
        /// Diagnostic trace.
        trace: String,
        /// Agent that failed.
        agent: String,
        /// Phase the job was in, for aborts.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<JobPhase>,
        /// Round the job was in, for aborts.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u32>,
    },
}

impl Payload {
    /// The topic this payload travels on.
    pub fn topic(&self) -> Topic {
        match self {
            Payload::IntentRequest { .. } => Topic::IntentRequest,
            Payload::GroundingRequest { .. } => Topic::GroundingRequest,
            Payload::GroundingResult { .. } => Topic::GroundingResult,
            Payload::StructureInferenceRequest { .. } => Topic::StructureInferenceRequest,
            Payload::StructureInferenceResult { .. } => Topic::StructureInferenceResult,
            Payload::DetectionRequest { .. } => Topic::DetectionRequest,
            Payload::DetectionResult { .. } => Topic::DetectionResult,
            Payload::MergeRequest { .. } => Topic::MergeRequest,
            Payload::MergeResult { .. } => Topic::MergeResult,
            Payload::DesignRequest { .. } => Topic::DesignRequest,
            Payload::DesignRefineRequest { .. } => Topic::DesignRefineRequest,
            Payload::DesignResult { .. } => Topic::DesignResult,
            Payload::GenerationRequest { .. } => Topic::GenerationRequest,
            Payload::GenerationResult { .. } => Topic::GenerationResult,
            Payload::StructuralReviewRequest(_) => Topic::StructuralReviewRequest,
            Payload::AestheticReviewRequest(_) => Topic::AestheticReviewRequest,
            Payload::ReviewResult { .. } => Topic::ReviewResult,
            Payload::ArbiterResult(_) => Topic::ArbiterResult,
            Payload::VectorizationRequest { .. } => Topic::VectorizationRequest,
            Payload::VectorizationResult { .. } => Topic::VectorizationResult,
            Payload::Completion { .. } => Topic::Completion,
            Payload::PipelineError { .. } => Topic::PipelineError,
        }
    }
}
