//! Critique scores, fused reviews and the stop/refine rule.

use serde::{Deserialize, Serialize};

/// Identifies which critic produced a [`CritiqueScores`] record.
///
/// The two built-in critics are `structure` and `aesthetic`; the arbiter can
/// be configured to require additional kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CritiqueKind(String);

impl CritiqueKind {
    /// The structural critic.
    pub fn structure() -> Self {
        Self("structure".to_string())
    }

    /// The aesthetic critic.
    pub fn aesthetic() -> Self {
        Self("aesthetic".to_string())
    }

    /// Wraps an arbitrary kind name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Kind name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the structural critic.
    pub fn is_structure(&self) -> bool {
        self.0 == "structure"
    }

    /// Whether this is the aesthetic critic.
    pub fn is_aesthetic(&self) -> bool {
        self.0 == "aesthetic"
    }
}

impl std::fmt::Display for CritiqueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scores reported by one critic for one candidate.
///
/// Every score is optional: critics only fill in what they measure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CritiqueScores {
    /// 0 to 100, how legible the symbol is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarity_score: Option<f64>,
    /// 0 to 100, visual quality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aesthetic_score: Option<f64>,
    /// 0 to 100, how recognisable the subject is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognizability_score: Option<f64>,
    /// Penalty for structural deviations from the spec; lower is better.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_penalty: Option<f64>,
    /// Rule violations found.
    #[serde(default)]
    pub violations: Vec<String>,
    /// Free-form improvement hints.
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl CritiqueScores {
    /// Convenience constructor with all four scores present.
    pub fn scored(clarity: f64, aesthetic: f64, recognizability: f64, penalty: f64) -> Self {
        Self {
            clarity_score: Some(clarity),
            aesthetic_score: Some(aesthetic),
            recognizability_score: Some(recognizability),
            structure_penalty: Some(penalty),
            ..Self::default()
        }
    }
}

/// The single score record the arbiter derives from all critics of a round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusedReview {
    /// Mean clarity across critics.
    pub clarity_score: f64,
    /// Aesthetic critic's score, or fused clarity when it has none.
    pub aesthetic_score: f64,
    /// Minimum recognizability across critics.
    pub recognizability_score: f64,
    /// Structural critic's penalty.
    pub structure_penalty: f64,
    /// Union of all critics' violations, first occurrence order.
    #[serde(default)]
    pub violations: Vec<String>,
    /// Concatenated suggestions, capped.
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl FusedReview {
    /// Fused record with the four scores set and no notes.
    pub fn with_scores(clarity: f64, aesthetic: f64, recognizability: f64, penalty: f64) -> Self {
        Self {
            clarity_score: clarity,
            aesthetic_score: aesthetic,
            recognizability_score: recognizability,
            structure_penalty: penalty,
            ..Self::default()
        }
    }
}

/// Arbiter verdict for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// All thresholds met; finalize.
    Stop,
    /// At least one threshold missed; run another round.
    Refine,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Stop => write!(f, "stop"),
            Decision::Refine => write!(f, "refine"),
        }
    }
}

/// Minimum acceptable scores and maximum structural penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Minimum fused clarity.
    #[serde(default = "default_score")]
    pub clarity: f64,
    /// Minimum fused aesthetic score.
    #[serde(default = "default_score")]
    pub aesthetic: f64,
    /// Minimum fused recognizability.
    #[serde(default = "default_score")]
    pub recognizability: f64,
    /// Maximum tolerated structure penalty.
    #[serde(default = "default_max_penalty")]
    pub max_structure_penalty: f64,
}

fn default_score() -> f64 {
    80.0
}

fn default_max_penalty() -> f64 {
    20.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            clarity: default_score(),
            aesthetic: default_score(),
            recognizability: default_score(),
            max_structure_penalty: default_max_penalty(),
        }
    }
}

impl Thresholds {
    /// Whether a fused review passes every threshold at once.
    pub fn passes(&self, review: &FusedReview) -> bool {
        review.clarity_score >= self.clarity
            && review.aesthetic_score >= self.aesthetic
            && review.recognizability_score >= self.recognizability
            && review.structure_penalty <= self.max_structure_penalty
    }

    /// `Stop` iff [`passes`](Self::passes), otherwise `Refine`.
    pub fn decide(&self, review: &FusedReview) -> Decision {
        if self.passes(review) {
            Decision::Stop
        } else {
            Decision::Refine
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_all_thresholds_met() {
        let t = Thresholds::default();
        let fused = FusedReview::with_scores(90.0, 85.0, 90.0, 0.0);
        assert_eq!(t.decide(&fused), Decision::Stop);
    }

    #[test]
    fn test_scenario_two_fields_violated() {
        let t = Thresholds::default();
        let fused = FusedReview::with_scores(90.0, 85.0, 5.0, 70.0);
        assert_eq!(t.decide(&fused), Decision::Refine);
    }

    #[test]
    fn test_each_field_crosses_boundary_independently() {
        let t = Thresholds::default();
        let base = FusedReview::with_scores(80.0, 80.0, 80.0, 20.0);
        assert_eq!(t.decide(&base), Decision::Stop, "boundary values pass");

        let mut r = base.clone();
        r.clarity_score = 79.9;
        assert_eq!(t.decide(&r), Decision::Refine);

        let mut r = base.clone();
        r.aesthetic_score = 79.9;
        assert_eq!(t.decide(&r), Decision::Refine);

        let mut r = base.clone();
        r.recognizability_score = 79.9;
        assert_eq!(t.decide(&r), Decision::Refine);

        let mut r = base;
        r.structure_penalty = 20.1;
        assert_eq!(t.decide(&r), Decision::Refine);
    }

    #[test]
    fn test_recognizability_alone_does_not_stop() {
        let t = Thresholds::default();
        let fused = FusedReview::with_scores(50.0, 90.0, 100.0, 0.0);
        assert_eq!(t.decide(&fused), Decision::Refine);
    }

    #[test]
    fn test_thresholds_partial_deserialize() {
        let t: Thresholds = serde_json::from_str(r#"{"clarity": 60}"#).unwrap();
        assert_eq!(t.clarity, 60.0);
        assert_eq!(t.aesthetic, 80.0);
        assert_eq!(t.max_structure_penalty, 20.0);
    }

    #[test]
    fn test_critique_kind_serializes_as_string() {
        let json = serde_json::to_string(&CritiqueKind::structure()).unwrap();
        assert_eq!(json, "\"structure\"");
        assert!(CritiqueKind::aesthetic().is_aesthetic());
        assert_eq!(Decision::Refine.to_string(), "refine");
    }
}
