use serde::{Deserialize, Serialize};

/// Every named channel on the bus.
///
/// Request/reply pairs follow the worker contracts; `IntentRequest`,
/// `Completion` and `PipelineError` are the pipeline's own entry, exit and
/// diagnostic topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// A new job: user text and optional reference image.
    #[serde(rename = "intent.request")]
    IntentRequest,
    /// Ask for grounding of the user text against world knowledge.
    #[serde(rename = "grounding.request")]
    GroundingRequest,
    /// Grounded default spec.
    #[serde(rename = "grounding.result")]
    GroundingResult,
    /// Ask for a structural spec inferred from the user text.
    #[serde(rename = "structure_inference.request")]
    StructureInferenceRequest,
    /// Inferred structural spec.
    #[serde(rename = "structure_inference.result")]
    StructureInferenceResult,
    /// Ask for detection on the reference image.
    #[serde(rename = "detection.request")]
    DetectionRequest,
    /// Detector output.
    #[serde(rename = "detection.result")]
    DetectionResult,
    /// Ask for the three partial specs to be merged.
    #[serde(rename = "merge.request")]
    MergeRequest,
    /// Merged structural spec.
    #[serde(rename = "merge.result")]
    MergeResult,
    /// Ask for an initial style descriptor.
    #[serde(rename = "design.request")]
    DesignRequest,
    /// Ask for a refined style descriptor given a fused review.
    #[serde(rename = "design.refine_request")]
    DesignRefineRequest,
    /// Style descriptor (initial or refined).
    #[serde(rename = "design.result")]
    DesignResult,
    /// Ask for candidate images.
    #[serde(rename = "generation.request")]
    GenerationRequest,
    /// Candidate images and the best pick.
    #[serde(rename = "generation.result")]
    GenerationResult,
    /// Ask the structural critic to score a candidate.
    #[serde(rename = "review.structural_request")]
    StructuralReviewRequest,
    /// Ask the aesthetic critic to score a candidate.
    #[serde(rename = "review.aesthetic_request")]
    AestheticReviewRequest,
    /// One critic's scores.
    #[serde(rename = "review.result")]
    ReviewResult,
    /// Fused decision for a round.
    #[serde(rename = "arbiter.result")]
    ArbiterResult,
    /// Ask for the best candidate to be traced to vector form.
    #[serde(rename = "vectorization.request")]
    VectorizationRequest,
    /// Vector artifact path.
    #[serde(rename = "vectorization.result")]
    VectorizationResult,
    /// Terminal message of a job.
    #[serde(rename = "completion")]
    Completion,
    /// Handler failures and job aborts.
    #[serde(rename = "pipeline.error")]
    PipelineError,
}

impl Topic {
    /// All topics, in pipeline order.
    pub const ALL: [Topic; 22] = [
        Topic::IntentRequest,
        Topic::GroundingRequest,
        Topic::GroundingResult,
        Topic::StructureInferenceRequest,
        Topic::StructureInferenceResult,
        Topic::DetectionRequest,
        Topic::DetectionResult,
        Topic::MergeRequest,
        Topic::MergeResult,
        Topic::DesignRequest,
        Topic::DesignRefineRequest,
        Topic::DesignResult,
        Topic::GenerationRequest,
        Topic::GenerationResult,
        Topic::StructuralReviewRequest,
        Topic::AestheticReviewRequest,
        Topic::ReviewResult,
        Topic::ArbiterResult,
        Topic::VectorizationRequest,
        Topic::VectorizationResult,
        Topic::Completion,
        Topic::PipelineError,
    ];

    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::IntentRequest => "intent.request",
            Topic::GroundingRequest => "grounding.request",
            Topic::GroundingResult => "grounding.result",
            Topic::StructureInferenceRequest => "structure_inference.request",
            Topic::StructureInferenceResult => "structure_inference.result",
            Topic::DetectionRequest => "detection.request",
            Topic::DetectionResult => "detection.result",
            Topic::MergeRequest => "merge.request",
            Topic::MergeResult => "merge.result",
            Topic::DesignRequest => "design.request",
            Topic::DesignRefineRequest => "design.refine_request",
            Topic::DesignResult => "design.result",
            Topic::GenerationRequest => "generation.request",
            Topic::GenerationResult => "generation.result",
            Topic::StructuralReviewRequest => "review.structural_request",
            Topic::AestheticReviewRequest => "review.aesthetic_request",
            Topic::ReviewResult => "review.result",
            Topic::ArbiterResult => "arbiter.result",
            Topic::VectorizationRequest => "vectorization.request",
            Topic::VectorizationResult => "vectorization.result",
            Topic::Completion => "completion",
            Topic::PipelineError => "pipeline.error",
        }
    }

    /// Reply topics whose messages belong to exactly one waiting job.
    ///
    /// The bus hands these to the job's registered waiter; with no waiter
    /// the message is an orphan and is dropped instead of queued.
    pub fn is_routed(&self) -> bool {
        matches!(
            self,
            Topic::GroundingResult
                | Topic::StructureInferenceResult
                | Topic::DetectionResult
                | Topic::MergeResult
                | Topic::DesignResult
                | Topic::GenerationResult
                | Topic::ArbiterResult
                | Topic::VectorizationResult
        )
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = crate::EmblemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::EmblemError::Bus(format!("unknown topic '{s}'")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_match_serde() {
        for topic in Topic::ALL {
            let json = serde_json::to_string(&topic).unwrap();
            assert_eq!(json, format!("\"{}\"", topic.as_str()));
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
    }

    #[test]
    fn test_routed_topics() {
        assert!(Topic::GroundingResult.is_routed());
        assert!(Topic::ArbiterResult.is_routed());
        assert!(!Topic::ReviewResult.is_routed());
        assert!(!Topic::Completion.is_routed());
        assert!(!Topic::GroundingRequest.is_routed());
    }

    #[test]
    fn test_unknown_topic_rejected() {
        assert!("nope.request".parse::<Topic>().is_err());
    }
}
