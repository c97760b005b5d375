use crate::agent::{Agent, Subscription};
use crate::bus::Bus;
use crate::planner::is_job_abort;
use async_trait::async_trait;
use emblem_core::{
    ArbiterConfig, ArbiterVerdict, CritiqueKind, CritiqueScores, EmblemError, EmblemResult,
    FusedReview, Message, Payload, Topic,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Cap on concatenated suggestions in a fused review.
pub const MAX_SUGGESTIONS: usize = 50;

/// Buffers critique results per job and emits one fused stop/refine
/// decision once every required kind has reported.
pub struct Arbiter {
    bus: Arc<Bus>,
    config: ArbiterConfig,
    buffers: Mutex<HashMap<String, BTreeMap<CritiqueKind, CritiqueScores>>>,
}

impl Arbiter {
    /// Arbiter deciding with `config` thresholds and required kinds.
    pub fn new(bus: Arc<Bus>, config: ArbiterConfig) -> Self {
        Self {
            bus,
            config,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Kinds currently buffered for a job.
    pub fn buffered_kinds(&self, job_id: &str) -> Vec<CritiqueKind> {
        self.buffers
            .lock()
            .get(job_id)
            .map(|slot| slot.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a job's partial results.
    fn discard(&self, job_id: &str) {
        if let Some(slot) = self.buffers.lock().remove(job_id) {
            debug!(job_id = %job_id, kinds = slot.len(), "Arbiter: dropped partial reviews of aborted job");
        }
    }

    /// Store one result; returns the complete set once every required kind
    /// is present, clearing the job's buffer.
    fn buffer(
        &self,
        job_id: &str,
        kind: CritiqueKind,
        result: CritiqueScores,
    ) -> Option<BTreeMap<CritiqueKind, CritiqueScores>> {
        let mut buffers = self.buffers.lock();
        let slot = buffers.entry(job_id.to_string()).or_default();
        slot.insert(kind, result);
        if self.config.required_kinds.iter().all(|k| slot.contains_key(k)) {
            buffers.remove(job_id)
        } else {
            None
        }
    }
}

/// Fuse per-critic results into one review.
///
/// Kinds are visited in `required` order so violations and suggestions come
/// out deterministically.
pub fn fuse(
    parts: &BTreeMap<CritiqueKind, CritiqueScores>,
    required: &[CritiqueKind],
) -> FusedReview {
    let ordered: Vec<&CritiqueScores> = required.iter().filter_map(|k| parts.get(k)).collect();

    let clarities: Vec<f64> = ordered.iter().filter_map(|p| p.clarity_score).collect();
    let clarity = if clarities.is_empty() {
        0.0
    } else {
        clarities.iter().sum::<f64>() / clarities.len() as f64
    };

    let aesthetic = parts
        .iter()
        .find(|(k, _)| k.is_aesthetic())
        .and_then(|(_, p)| p.aesthetic_score)
        .unwrap_or(clarity);

    // A missing score counts as 100 so absence alone never vetoes.
    let recognizability = required
        .iter()
        .map(|k| {
            parts
                .get(k)
                .and_then(|p| p.recognizability_score)
                .unwrap_or(100.0)
        })
        .fold(100.0_f64, f64::min);

    let structure_penalty = parts
        .iter()
        .find(|(k, _)| k.is_structure())
        .and_then(|(_, p)| p.structure_penalty)
        .unwrap_or(0.0);

    let mut seen = HashSet::new();
    let violations = ordered
        .iter()
        .flat_map(|p| p.violations.iter())
        .filter(|v| seen.insert(v.as_str()))
        .cloned()
        .collect();

    let suggestions = ordered
        .iter()
        .flat_map(|p| p.suggestions.iter())
        .take(MAX_SUGGESTIONS)
        .cloned()
        .collect();

    FusedReview {
        clarity_score: clarity,
        aesthetic_score: aesthetic,
        recognizability_score: recognizability,
        structure_penalty,
        violations,
        suggestions,
    }
}

#[async_trait]
impl Agent for Arbiter {
    fn name(&self) -> &str {
        "Arbiter"
    }

    fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::Consume(Topic::ReviewResult),
            Subscription::Observe(Topic::PipelineError),
        ]
    }

    async fn handle(&self, msg: Message) -> EmblemResult<()> {
        if msg.topic == Topic::PipelineError {
            if is_job_abort(&msg) {
                self.discard(&msg.job_id);
            }
            return Ok(());
        }
        let Payload::ReviewResult { kind, result } = &msg.payload else {
            return Err(EmblemError::UnexpectedPayload {
                topic: msg.topic,
                expected: "review_result",
            });
        };

        if !self.config.required_kinds.contains(kind) {
            debug!(job_id = %msg.job_id, kind = %kind, "Arbiter: ignoring unrequired critique kind");
            return Ok(());
        }

        let Some(parts) = self.buffer(&msg.job_id, kind.clone(), result.clone()) else {
            debug!(job_id = %msg.job_id, kind = %kind, "Arbiter: buffered, waiting for other critics");
            return Ok(());
        };

        let review = fuse(&parts, &self.config.required_kinds);
        let decision = self.config.thresholds.decide(&review);
        info!(
            job_id = %msg.job_id,
            decision = %decision,
            clarity = review.clarity_score,
            aesthetic = review.aesthetic_score,
            recognizability = review.recognizability_score,
            structure_penalty = review.structure_penalty,
            "Arbiter: decision"
        );

        self.bus.publish(msg.reply(
            self.name(),
            Payload::ArbiterResult(ArbiterVerdict {
                decision,
                review,
                raw: parts,
            }),
        ));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use emblem_core::{Decision, JobPhase, Thresholds};
    use std::time::Duration;

    fn parts(entries: Vec<(CritiqueKind, CritiqueScores)>) -> BTreeMap<CritiqueKind, CritiqueScores> {
        entries.into_iter().collect()
    }

    fn required() -> Vec<CritiqueKind> {
        vec![CritiqueKind::structure(), CritiqueKind::aesthetic()]
    }

    fn review_msg(job: &str, kind: CritiqueKind, scores: CritiqueScores) -> Message {
        Message::new(job, "Reviewer", Payload::ReviewResult { kind, result: scores })
    }

    #[test]
    fn test_fuse_rules() {
        let mut structure = CritiqueScores::scored(90.0, 60.0, 95.0, 10.0);
        structure.violations = vec!["gap".into(), "overlap".into()];
        structure.suggestions = vec!["close gap".into()];
        let mut aesthetic = CritiqueScores::scored(70.0, 88.0, 75.0, 99.0);
        aesthetic.violations = vec!["overlap".into(), "noise".into()];
        aesthetic.suggestions = vec!["simplify".into()];

        let fused = fuse(
            &parts(vec![
                (CritiqueKind::structure(), structure),
                (CritiqueKind::aesthetic(), aesthetic),
            ]),
            &required(),
        );
        assert_eq!(fused.clarity_score, 80.0);
        assert_eq!(fused.aesthetic_score, 88.0);
        assert_eq!(fused.recognizability_score, 75.0);
        assert_eq!(fused.structure_penalty, 10.0, "penalty comes from the structural critic");
        assert_eq!(fused.violations, vec!["gap", "overlap", "noise"]);
        assert_eq!(fused.suggestions, vec!["close gap", "simplify"]);
    }

    #[test]
    fn test_fuse_missing_scores_fall_back() {
        let structure = CritiqueScores {
            clarity_score: Some(60.0),
            ..Default::default()
        };
        let aesthetic = CritiqueScores::default();
        let fused = fuse(
            &parts(vec![
                (CritiqueKind::structure(), structure),
                (CritiqueKind::aesthetic(), aesthetic),
            ]),
            &required(),
        );
        assert_eq!(fused.clarity_score, 60.0);
        assert_eq!(fused.aesthetic_score, 60.0, "aesthetic falls back to clarity");
        assert_eq!(fused.recognizability_score, 100.0);
        assert_eq!(fused.structure_penalty, 0.0);
    }

    #[test]
    fn test_fuse_no_clarity_is_zero() {
        let fused = fuse(
            &parts(vec![
                (CritiqueKind::structure(), CritiqueScores::default()),
                (CritiqueKind::aesthetic(), CritiqueScores::default()),
            ]),
            &required(),
        );
        assert_eq!(fused.clarity_score, 0.0);
        assert_eq!(fused.aesthetic_score, 0.0);
    }

    #[test]
    fn test_fuse_caps_suggestions() {
        let mut structure = CritiqueScores::default();
        structure.suggestions = (0..40).map(|i| format!("s{i}")).collect();
        let mut aesthetic = CritiqueScores::default();
        aesthetic.suggestions = (0..40).map(|i| format!("a{i}")).collect();
        let fused = fuse(
            &parts(vec![
                (CritiqueKind::structure(), structure),
                (CritiqueKind::aesthetic(), aesthetic),
            ]),
            &required(),
        );
        assert_eq!(fused.suggestions.len(), MAX_SUGGESTIONS);
        assert_eq!(fused.suggestions[39], "s39");
        assert_eq!(fused.suggestions[40], "a0");
    }

    #[test]
    fn test_low_recognizability_anywhere_vetoes() {
        let fused = fuse(
            &parts(vec![
                (CritiqueKind::structure(), CritiqueScores::scored(90.0, 90.0, 5.0, 0.0)),
                (CritiqueKind::aesthetic(), CritiqueScores::scored(90.0, 90.0, 99.0, 0.0)),
            ]),
            &required(),
        );
        assert_eq!(fused.recognizability_score, 5.0);
        assert_eq!(Thresholds::default().decide(&fused), Decision::Refine);
    }

    #[tokio::test]
    async fn test_decision_only_after_all_kinds() {
        let bus = Arc::new(Bus::new());
        let arbiter = Arbiter::new(bus.clone(), ArbiterConfig::default());
        let pending = bus.expect(Topic::ArbiterResult, "job");

        arbiter
            .handle(review_msg("job", CritiqueKind::structure(), CritiqueScores::scored(90.0, 85.0, 90.0, 0.0)))
            .await
            .unwrap();
        assert_eq!(arbiter.buffered_kinds("job"), vec![CritiqueKind::structure()]);
        assert_eq!(bus.stats().waiters, 1, "no decision yet");

        // A second structural result only replaces the buffered one.
        arbiter
            .handle(review_msg("job", CritiqueKind::structure(), CritiqueScores::scored(90.0, 85.0, 90.0, 0.0)))
            .await
            .unwrap();
        assert_eq!(bus.stats().waiters, 1);

        arbiter
            .handle(review_msg("job", CritiqueKind::aesthetic(), CritiqueScores::scored(90.0, 85.0, 90.0, 0.0)))
            .await
            .unwrap();
        assert!(arbiter.buffered_kinds("job").is_empty(), "buffer cleared after decision");

        let msg = pending.wait(Duration::from_secs(1)).await.unwrap();
        match msg.payload {
            Payload::ArbiterResult(verdict) => {
                assert_eq!(verdict.decision, Decision::Stop);
                assert_eq!(verdict.raw.len(), 2);
                assert_eq!(verdict.review.clarity_score, 90.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_each_round_needs_fresh_results() {
        let bus = Arc::new(Bus::new());
        let arbiter = Arbiter::new(bus.clone(), ArbiterConfig::default());

        let first = bus.expect(Topic::ArbiterResult, "job");
        for kind in required() {
            arbiter
                .handle(review_msg("job", kind, CritiqueScores::scored(90.0, 85.0, 5.0, 70.0)))
                .await
                .unwrap();
        }
        let verdict = first.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            verdict.payload,
            Payload::ArbiterResult(ArbiterVerdict { decision: Decision::Refine, .. })
        ));

        // One kind from the next round alone must not produce a decision.
        let second = bus.expect(Topic::ArbiterResult, "job");
        arbiter
            .handle(review_msg("job", CritiqueKind::aesthetic(), CritiqueScores::scored(95.0, 95.0, 95.0, 0.0)))
            .await
            .unwrap();
        assert!(second.wait(Duration::from_millis(30)).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_unrequired_kind_ignored_and_wrong_payload_rejected() {
        let bus = Arc::new(Bus::new());
        let arbiter = Arbiter::new(bus.clone(), ArbiterConfig::default());
        arbiter
            .handle(review_msg("job", CritiqueKind::new("color"), CritiqueScores::default()))
            .await
            .unwrap();
        assert!(arbiter.buffered_kinds("job").is_empty());

        let wrong = Message::new("job", "x", Payload::DesignResult { style_json: "{}".into() });
        let err = arbiter.handle(wrong).await.unwrap_err();
        assert!(matches!(err, EmblemError::UnexpectedPayload { .. }));
    }

    fn failure(job: &str, agent: &str, phase: Option<JobPhase>) -> Message {
        Message::new(
            job,
            agent,
            Payload::PipelineError {
                err: "no arbiter.result".into(),
                trace: String::new(),
                agent: agent.into(),
                phase,
                round: phase.map(|_| 1),
            },
        )
    }

    #[tokio::test]
    async fn test_job_abort_drops_partial_reviews() {
        let bus = Arc::new(Bus::new());
        let arbiter = Arbiter::new(bus.clone(), ArbiterConfig::default());
        arbiter
            .handle(review_msg("job", CritiqueKind::structure(), CritiqueScores::scored(20.0, 20.0, 20.0, 90.0)))
            .await
            .unwrap();
        arbiter
            .handle(review_msg("other", CritiqueKind::structure(), CritiqueScores::default()))
            .await
            .unwrap();

        // A worker failure is not an abort; the buffer stays.
        arbiter.handle(failure("job", "AestheticCritic", None)).await.unwrap();
        assert_eq!(arbiter.buffered_kinds("job"), vec![CritiqueKind::structure()]);

        arbiter
            .handle(failure("job", "Planner", Some(JobPhase::AwaitingReviews)))
            .await
            .unwrap();
        assert!(arbiter.buffered_kinds("job").is_empty());
        assert_eq!(arbiter.buffered_kinds("other"), vec![CritiqueKind::structure()]);

        // A rerun of the same job id must not fuse with the aborted run.
        let pending = bus.expect(Topic::ArbiterResult, "job");
        arbiter
            .handle(review_msg("job", CritiqueKind::aesthetic(), CritiqueScores::scored(95.0, 95.0, 95.0, 0.0)))
            .await
            .unwrap();
        assert!(pending.wait(Duration::from_millis(30)).await.unwrap_err().is_timeout());
        assert_eq!(arbiter.buffered_kinds("job"), vec![CritiqueKind::aesthetic()]);
    }

    #[tokio::test]
    async fn test_custom_kinds_and_thresholds() {
        let bus = Arc::new(Bus::new());
        let config = ArbiterConfig {
            required_kinds: vec![
                CritiqueKind::structure(),
                CritiqueKind::aesthetic(),
                CritiqueKind::new("legibility"),
            ],
            thresholds: Thresholds {
                clarity: 50.0,
                aesthetic: 50.0,
                recognizability: 50.0,
                max_structure_penalty: 40.0,
            },
        };
        let arbiter = Arbiter::new(bus.clone(), config);
        let pending = bus.expect(Topic::ArbiterResult, "job");
        arbiter
            .handle(review_msg("job", CritiqueKind::structure(), CritiqueScores::scored(60.0, 0.0, 60.0, 30.0)))
            .await
            .unwrap();
        arbiter
            .handle(review_msg("job", CritiqueKind::aesthetic(), CritiqueScores::scored(60.0, 70.0, 60.0, 0.0)))
            .await
            .unwrap();
        assert_eq!(arbiter.buffered_kinds("job").len(), 2);
        arbiter
            .handle(review_msg("job", CritiqueKind::new("legibility"), CritiqueScores::scored(60.0, 0.0, 60.0, 0.0)))
            .await
            .unwrap();
        let msg = pending.wait(Duration::from_secs(1)).await.unwrap();
        match msg.payload {
            Payload::ArbiterResult(v) => assert_eq!(v.decision, Decision::Stop),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
