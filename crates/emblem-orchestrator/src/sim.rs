//! Deterministic stand-in workers.
//!
//! Real workers (language models, image generators, tracers) live outside
//! this crate and implement [`Agent`] the same way [`ScriptedWorker`] does:
//! consume a request topic, publish one reply carrying the request's job id.
//! [`standard_workers`] wires a full pipeline whose review scores follow a
//! per-round [`PipelineScript`], for demos and integration tests.

use crate::agent::{spawn_agent, Agent, AgentHandle, Subscription};
use crate::bus::Bus;
use async_trait::async_trait;
use emblem_core::{
    CritiqueKind, CritiqueScores, EmblemError, EmblemResult, Message, Payload, Topic,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Maps a request to its reply. `Ok(None)` means the worker stays silent.
pub type Responder = Arc<dyn Fn(&Message) -> EmblemResult<Option<Payload>> + Send + Sync>;

/// A worker whose replies come from a closure.
pub struct ScriptedWorker {
    name: String,
    bus: Arc<Bus>,
    topics: Vec<Topic>,
    delay: Duration,
    responder: Responder,
    received: AtomicUsize,
}

impl ScriptedWorker {
    /// Worker consuming `topics` and answering through `responder`.
    pub fn new<F>(name: impl Into<String>, bus: Arc<Bus>, topics: Vec<Topic>, responder: F) -> Self
    where
        F: Fn(&Message) -> EmblemResult<Option<Payload>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            bus,
            topics,
            delay: Duration::ZERO,
            responder: Arc::new(responder),
            received: AtomicUsize::new(0),
        }
    }

    /// Wait this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Requests received so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.topics.iter().copied().map(Subscription::Consume).collect()
    }

    async fn handle(&self, msg: Message) -> EmblemResult<()> {
        self.received.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match (self.responder)(&msg)? {
            Some(payload) => self.bus.publish(msg.reply(self.name.as_str(), payload)),
            None => debug!(worker = %self.name, job_id = %msg.job_id, topic = %msg.topic, "Worker: no reply"),
        }
        Ok(())
    }
}

/// Behaviour of the stand-in pipeline.
#[derive(Debug, Clone)]
pub struct PipelineScript {
    /// Entity name reported by grounding and inference.
    pub entity_name: String,
    /// Entity location reported by grounding and inference.
    pub location: String,
    /// Structural critic scores, one per round; the last one repeats.
    pub structure_scores: Vec<CritiqueScores>,
    /// Aesthetic critic scores, one per round; the last one repeats.
    pub aesthetic_scores: Vec<CritiqueScores>,
    /// Whether the grounder answers at all.
    pub answer_grounding: bool,
    /// Whether the detector answers at all.
    pub answer_detection: bool,
    /// Whether the vectorizer produces an artifact.
    pub produce_svg: bool,
    /// Latency of every worker.
    pub delay: Duration,
}

impl PipelineScript {
    /// Critics fail every round before `round` and pass from `round` on.
    pub fn converging_at(round: u32) -> Self {
        let failing = round.saturating_sub(1) as usize;
        let mut structure = vec![CritiqueScores::scored(60.0, 60.0, 50.0, 40.0); failing];
        structure.push(CritiqueScores::scored(92.0, 80.0, 90.0, 5.0));
        let mut aesthetic = vec![CritiqueScores::scored(70.0, 55.0, 85.0, 0.0); failing];
        aesthetic.push(CritiqueScores::scored(88.0, 86.0, 91.0, 0.0));
        Self {
            structure_scores: structure,
            aesthetic_scores: aesthetic,
            ..Self::base()
        }
    }

    /// Critics never pass.
    pub fn never_converging() -> Self {
        Self {
            structure_scores: vec![CritiqueScores::scored(90.0, 85.0, 5.0, 70.0)],
            aesthetic_scores: vec![CritiqueScores::scored(90.0, 85.0, 90.0, 0.0)],
            ..Self::base()
        }
    }

    /// Use another entity.
    pub fn for_entity(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.entity_name = name.into();
        self.location = location.into();
        self
    }

    fn base() -> Self {
        Self {
            entity_name: "Zhongshan Bridge".into(),
            location: "Lanzhou".into(),
            structure_scores: Vec::new(),
            aesthetic_scores: Vec::new(),
            answer_grounding: true,
            answer_detection: true,
            produce_svg: true,
            delay: Duration::ZERO,
        }
    }

    fn entity(&self) -> Value {
        json!({"name": self.entity_name, "location": self.location})
    }
}

impl Default for PipelineScript {
    fn default() -> Self {
        Self::converging_at(1)
    }
}

fn for_round(scores: &[CritiqueScores], round: usize) -> CritiqueScores {
    scores
        .get(round.saturating_sub(1))
        .or(scores.last())
        .cloned()
        .unwrap_or_default()
}

/// Counts requests per job, giving the 1-based round of each.
#[derive(Default)]
struct RoundCounter(Mutex<HashMap<String, usize>>);

impl RoundCounter {
    fn next(&self, job_id: &str) -> usize {
        let mut rounds = self.0.lock();
        let round = rounds.entry(job_id.to_string()).or_insert(0);
        *round += 1;
        *round
    }
}

fn unexpected(msg: &Message, expected: &'static str) -> EmblemError {
    EmblemError::UnexpectedPayload {
        topic: msg.topic,
        expected,
    }
}

fn critic(
    bus: &Arc<Bus>,
    name: &str,
    topic: Topic,
    kind: CritiqueKind,
    scores: Vec<CritiqueScores>,
) -> ScriptedWorker {
    let rounds = RoundCounter::default();
    ScriptedWorker::new(name, bus.clone(), vec![topic], move |msg| match &msg.payload {
        Payload::StructuralReviewRequest(_) | Payload::AestheticReviewRequest(_) => {
            let round = rounds.next(&msg.job_id);
            Ok(Some(Payload::ReviewResult {
                kind: kind.clone(),
                result: for_round(&scores, round),
            }))
        }
        _ => Err(unexpected(msg, "review_request")),
    })
}

/// Build every stand-in worker for `script` without starting them.
pub fn scripted_workers(bus: &Arc<Bus>, script: &PipelineScript) -> Vec<ScriptedWorker> {
    let entity = script.entity();

    let grounder = {
        let entity = entity.clone();
        let answer = script.answer_grounding;
        ScriptedWorker::new("Grounder", bus.clone(), vec![Topic::GroundingRequest], move |msg| {
            match &msg.payload {
                Payload::GroundingRequest { .. } if answer => Ok(Some(Payload::GroundingResult {
                    grounded: json!({"entity": entity, "palette": ["#1f3a5f", "#d4a373"]}),
                })),
                Payload::GroundingRequest { .. } => Ok(None),
                _ => Err(unexpected(msg, "grounding_request")),
            }
        })
    };

    let inference = {
        let entity = entity.clone();
        ScriptedWorker::new(
            "SpecInference",
            bus.clone(),
            vec![Topic::StructureInferenceRequest],
            move |msg| match &msg.payload {
                Payload::StructureInferenceRequest { user_text, .. } => {
                    Ok(Some(Payload::StructureInferenceResult {
                        spec: json!({
                            "entity": entity,
                            "elements": ["arch", "river"],
                            "prompt": user_text,
                        }),
                    }))
                }
                _ => Err(unexpected(msg, "structure_inference_request")),
            },
        )
    };

    let detector = {
        let answer = script.answer_detection;
        ScriptedWorker::new("Detector", bus.clone(), vec![Topic::DetectionRequest], move |msg| {
            match &msg.payload {
                Payload::DetectionRequest { image_path, .. } if answer => {
                    Ok(Some(Payload::DetectionResult {
                        detector: json!({"kind": "landmark", "source": image_path, "arches": 5}),
                    }))
                }
                Payload::DetectionRequest { .. } => Ok(None),
                _ => Err(unexpected(msg, "detection_request")),
            }
        })
    };

    let merger = ScriptedWorker::new("Merger", bus.clone(), vec![Topic::MergeRequest], |msg| {
        match &msg.payload {
            Payload::MergeRequest {
                user_spec,
                detector_spec,
                defaults,
            } => {
                let mut merged = defaults.as_object().cloned().unwrap_or_default();
                if let Some(user) = user_spec.as_object() {
                    merged.extend(user.clone());
                }
                if detector_spec.as_object().is_some_and(|d| !d.is_empty()) {
                    merged.insert("detector".into(), detector_spec.clone());
                }
                Ok(Some(Payload::MergeResult {
                    merged: Value::Object(merged),
                }))
            }
            _ => Err(unexpected(msg, "merge_request")),
        }
    });

    let designer = ScriptedWorker::new(
        "Designer",
        bus.clone(),
        vec![Topic::DesignRequest, Topic::DesignRefineRequest],
        |msg| match &msg.payload {
            Payload::DesignRequest {
                prior_style_json, ..
            } => Ok(Some(Payload::DesignResult {
                style_json: json!({
                    "revision": 1,
                    "seeded": prior_style_json.is_some(),
                    "stroke": 2.0,
                })
                .to_string(),
            })),
            Payload::DesignRefineRequest {
                prev_style_json,
                review_json,
                ..
            } => {
                let prev: Value = serde_json::from_str(prev_style_json)?;
                let revision = prev["revision"].as_u64().unwrap_or(0) + 1;
                Ok(Some(Payload::DesignResult {
                    style_json: json!({
                        "revision": revision,
                        "seeded": prev["seeded"],
                        "stroke": 2.0 + review_json.structure_penalty / 100.0,
                    })
                    .to_string(),
                }))
            }
            _ => Err(unexpected(msg, "design_request")),
        },
    );

    let generator = {
        let rounds = RoundCounter::default();
        ScriptedWorker::new("Generator", bus.clone(), vec![Topic::GenerationRequest], move |msg| {
            match &msg.payload {
                Payload::GenerationRequest { .. } => {
                    let round = rounds.next(&msg.job_id);
                    let candidates: Vec<String> = ["a", "b", "c"]
                        .iter()
                        .map(|c| format!("out/{}/round-{round}-{c}.png", msg.job_id))
                        .collect();
                    Ok(Some(Payload::GenerationResult {
                        best_png: candidates[0].clone(),
                        candidates,
                        best_review: None,
                    }))
                }
                _ => Err(unexpected(msg, "generation_request")),
            }
        })
    };

    let vectorizer = {
        let produce = script.produce_svg;
        ScriptedWorker::new(
            "Vectorizer",
            bus.clone(),
            vec![Topic::VectorizationRequest],
            move |msg| match &msg.payload {
                Payload::VectorizationRequest { png_path, .. } => {
                    Ok(Some(Payload::VectorizationResult {
                        svg_path: produce.then(|| png_path.replace(".png", ".svg")),
                    }))
                }
                _ => Err(unexpected(msg, "vectorization_request")),
            },
        )
    };

    let structural = critic(
        bus,
        "StructuralCritic",
        Topic::StructuralReviewRequest,
        CritiqueKind::structure(),
        script.structure_scores.clone(),
    );
    let aesthetic = critic(
        bus,
        "AestheticCritic",
        Topic::AestheticReviewRequest,
        CritiqueKind::aesthetic(),
        script.aesthetic_scores.clone(),
    );

    [
        grounder, inference, detector, merger, designer, generator, structural, aesthetic,
        vectorizer,
    ]
    .into_iter()
    .map(|w| w.with_delay(script.delay))
    .collect()
}

/// Start every stand-in worker for `script`.
pub fn standard_workers(bus: &Arc<Bus>, script: &PipelineScript) -> Vec<AgentHandle> {
    scripted_workers(bus, script)
        .into_iter()
        .map(|w| spawn_agent(Arc::new(w)))
        .collect()
}
