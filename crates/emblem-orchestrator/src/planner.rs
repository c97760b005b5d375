use crate::agent::{Agent, Subscription};
use crate::bus::{Bus, PendingReply};
use crate::job::JobState;
use crate::memory::MemoryAgent;
use crate::monitor::JobMonitor;
use async_trait::async_trait;
use emblem_core::{
    entity_key, ArbiterVerdict, Decision, EmblemError, EmblemResult, JobPhase, Message, Outcome,
    Payload, PlannerConfig, ReviewRequest, Topic,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SENDER: &str = "Planner";

/// Whether `msg` is the Planner's report that a job ended without completing.
pub fn is_job_abort(msg: &Message) -> bool {
    matches!(
        &msg.payload,
        Payload::PipelineError { agent, phase: Some(_), .. } if agent == SENDER
    )
}
const DESIGN_SCHEMA: &str = "{}";

/// Drives every job through its state machine.
///
/// Each intent request gets its own task owning a [`JobState`]; the task
/// publishes requests and joins the matching replies through job-keyed
/// waiters on the bus, so concurrent jobs never see each other's replies.
pub struct Planner {
    driver: JobDriver,
    jobs: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Planner {
    /// Planner with its own job monitor.
    pub fn new(bus: Arc<Bus>, config: PlannerConfig) -> Self {
        Self::with_monitor(bus, config, Arc::new(JobMonitor::new()))
    }

    /// Planner reporting into a shared monitor.
    pub fn with_monitor(bus: Arc<Bus>, config: PlannerConfig, monitor: Arc<JobMonitor>) -> Self {
        Self {
            driver: JobDriver {
                bus,
                config,
                monitor,
            },
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Phase and age tracking for live jobs.
    pub fn monitor(&self) -> &Arc<JobMonitor> {
        &self.driver.monitor
    }

    /// Number of job tasks still running.
    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().values().filter(|h| !h.is_finished()).count()
    }

    /// Abort every job older than `ttl`, reporting each on `pipeline.error`.
    ///
    /// Returns how many jobs were reaped.
    pub async fn reap_stale(&self, ttl: Duration) -> usize {
        let mut reaped = 0;
        for status in self.driver.monitor.stale(ttl).await {
            if let Some(task) = self.jobs.lock().remove(&status.job_id) {
                task.abort();
            }
            // A job that finished during the sweep is no longer tracked.
            let Some(status) = self.driver.monitor.abort_job(&status.job_id).await else {
                continue;
            };
            let err = EmblemError::JobAborted(status.job_id.clone());
            warn!(
                job_id = %status.job_id,
                phase = %status.phase,
                round = status.round,
                "Planner: reaped stale job"
            );
            self.driver.bus.publish(
                Message::new(
                    status.job_id.clone(),
                    SENDER,
                    Payload::PipelineError {
                        err: err.to_string(),
                        trace: format!("job exceeded ttl of {}s", ttl.as_secs()),
                        agent: SENDER.to_string(),
                        phase: Some(status.phase),
                        round: Some(status.round),
                    },
                )
                .with_error(err.to_string()),
            );
            reaped += 1;
        }
        reaped
    }

    /// Start the periodic stale-job sweep, if a job TTL is configured.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        let ttl = self.driver.config.job_ttl()?;
        let planner = Arc::clone(self);
        info!(
            ttl_secs = ttl.as_secs(),
            every_ms = every.as_millis() as u64,
            "Planner: reaper started"
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                planner.reap_stale(ttl).await;
            }
        }))
    }
}

#[async_trait]
impl Agent for Planner {
    fn name(&self) -> &str {
        SENDER
    }

    fn bus(&self) -> &Arc<Bus> {
        &self.driver.bus
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::Consume(Topic::IntentRequest)]
    }

    async fn handle(&self, msg: Message) -> EmblemResult<()> {
        let Payload::IntentRequest {
            user_text,
            image_path,
        } = msg.payload
        else {
            return Err(EmblemError::UnexpectedPayload {
                topic: msg.topic,
                expected: "intent_request",
            });
        };

        let job_id = msg.job_id;
        if self
            .jobs
            .lock()
            .get(&job_id)
            .is_some_and(|task| !task.is_finished())
        {
            warn!(job_id = %job_id, "Planner: job already running, duplicate intent ignored");
            return Ok(());
        }

        info!(job_id = %job_id, has_image = image_path.is_some(), "Planner: job started");
        self.driver.monitor.start_job(&job_id).await;

        let state = JobState::new(job_id.clone(), user_text, image_path);
        let driver = self.driver.clone();
        let jobs = Arc::clone(&self.jobs);
        let mut registry = self.jobs.lock();
        let task = tokio::spawn(async move {
            let job_id = state.job_id.clone();
            driver.drive(state).await;
            jobs.lock().remove(&job_id);
        });
        registry.insert(job_id, task);
        Ok(())
    }
}

/// Everything a job task needs, cloned into it.
#[derive(Clone)]
struct JobDriver {
    bus: Arc<Bus>,
    config: PlannerConfig,
    monitor: Arc<JobMonitor>,
}

impl JobDriver {
    async fn drive(&self, mut state: JobState) {
        match self.run(&mut state).await {
            Ok(outcome) => {
                self.monitor.finish_job(&state.job_id, outcome).await;
                info!(
                    job_id = %state.job_id,
                    outcome = ?outcome,
                    rounds = state.round(),
                    "Planner: job completed"
                );
            }
            Err(e) => self.abort(&mut state, e).await,
        }
    }

    async fn run(&self, state: &mut JobState) -> EmblemResult<Outcome> {
        let (user_spec, defaults) = self.gather_specs(state).await?;
        self.merge_specs(state, user_spec, defaults).await?;
        self.enter(state, JobPhase::AwaitingDesign).await?;
        self.design(state).await?;

        loop {
            self.enter(state, JobPhase::AwaitingGenerate).await?;
            self.generate(state).await?;

            self.enter(state, JobPhase::AwaitingReviews).await?;
            let verdict = self.review(state).await?;

            let converged = verdict.decision == Decision::Stop;
            if converged || state.budget_exhausted(self.config.max_rounds) {
                let outcome = if converged {
                    Outcome::Converged
                } else {
                    warn!(
                        job_id = %state.job_id,
                        round = state.round(),
                        "Planner: round budget spent, forcing finalization"
                    );
                    Outcome::Exhausted
                };
                self.finalize(state, verdict, outcome).await?;
                return Ok(outcome);
            }

            let round = state.begin_refinement()?;
            self.monitor
                .transition(&state.job_id, state.phase(), round)
                .await;
            info!(job_id = %state.job_id, round, "Planner: refining");
            self.refine(state, verdict).await?;
        }
    }

    async fn enter(&self, state: &mut JobState, phase: JobPhase) -> EmblemResult<()> {
        state.transition(phase)?;
        self.monitor
            .transition(&state.job_id, phase, state.round())
            .await;
        info!(job_id = %state.job_id, phase = %phase, round = state.round(), "Planner: phase");
        Ok(())
    }

    /// Register the reply waiter, then publish the request.
    fn request(&self, job_id: &str, reply: Topic, payload: Payload) -> PendingReply {
        let pending = self.bus.expect(reply, job_id);
        self.bus.publish(Message::new(job_id, SENDER, payload));
        pending
    }

    async fn join(&self, pending: PendingReply) -> EmblemResult<Message> {
        pending.wait(self.config.required_timeout()).await
    }

    /// Fan out the three spec requests and join their replies.
    ///
    /// Returns the inferred spec and the grounded defaults.
    async fn gather_specs(&self, state: &mut JobState) -> EmblemResult<(Value, Value)> {
        let job_id = state.job_id.clone();
        let grounding = self.request(
            &job_id,
            Topic::GroundingResult,
            Payload::GroundingRequest {
                user_text: state.user_text.clone(),
            },
        );
        let inference = self.request(
            &job_id,
            Topic::StructureInferenceResult,
            Payload::StructureInferenceRequest {
                user_text: state.user_text.clone(),
                detector_spec: None,
            },
        );
        let detection = state.image_path.clone().map(|image_path| {
            self.request(
                &job_id,
                Topic::DetectionResult,
                Payload::DetectionRequest {
                    image_path,
                    schema: self.config.detection_schema.clone(),
                },
            )
        });

        let required = async { tokio::try_join!(self.join(grounding), self.join(inference)) };
        let (required, detector) = tokio::join!(required, self.join_detection(&job_id, detection));
        let (grounded, inferred) = required?;

        let Payload::GroundingResult { grounded } = grounded.payload else {
            return Err(unexpected(Topic::GroundingResult, "grounding_result"));
        };
        let Payload::StructureInferenceResult { spec } = inferred.payload else {
            return Err(unexpected(Topic::StructureInferenceResult, "structure_inference_result"));
        };
        state.detector_spec = detector;
        Ok((spec, grounded))
    }

    /// Detection is optional: no image, a timeout or a malformed reply all
    /// degrade to an empty spec.
    async fn join_detection(&self, job_id: &str, pending: Option<PendingReply>) -> Value {
        let empty = Value::Object(Default::default());
        let Some(pending) = pending else {
            return empty;
        };
        match pending.wait(self.config.optional_timeout()).await {
            Ok(Message {
                payload: Payload::DetectionResult { detector },
                ..
            }) => detector,
            Ok(_) => {
                warn!(job_id = %job_id, "Planner: malformed detection result, continuing without it");
                empty
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Planner: detection unavailable, continuing without it");
                empty
            }
        }
    }

    async fn merge_specs(
        &self,
        state: &mut JobState,
        user_spec: Value,
        defaults: Value,
    ) -> EmblemResult<()> {
        self.enter(state, JobPhase::AwaitingMerge).await?;
        let reply = self
            .join(self.request(
                &state.job_id,
                Topic::MergeResult,
                Payload::MergeRequest {
                    user_spec,
                    detector_spec: state.detector_spec.clone(),
                    defaults,
                },
            ))
            .await?;
        let Payload::MergeResult { merged } = reply.payload else {
            return Err(unexpected(Topic::MergeResult, "merge_result"));
        };
        state.spec = merged;
        Ok(())
    }

    async fn design(&self, state: &mut JobState) -> EmblemResult<()> {
        let prior_style_json = self.prior_style(&state.job_id, &state.spec);
        let reply = self
            .join(self.request(
                &state.job_id,
                Topic::DesignResult,
                Payload::DesignRequest {
                    detector_spec: state.detector_spec.clone(),
                    schema: DESIGN_SCHEMA.to_string(),
                    structure_spec: state.spec.clone(),
                    prior_style_json,
                },
            ))
            .await?;
        state.style_json = Some(style_of(reply)?);
        Ok(())
    }

    /// Best converged style remembered for the job's entity.
    fn prior_style(&self, job_id: &str, spec: &Value) -> Option<String> {
        let key = entity_key(spec);
        match MemoryAgent::record(&self.bus, &key) {
            Ok(record) => {
                let style = record.and_then(|r| r.best).map(|b| b.style_json);
                if style.is_some() {
                    info!(job_id = %job_id, entity = %key, "Planner: reusing remembered style");
                }
                style
            }
            Err(e) => {
                warn!(job_id = %job_id, entity = %key, error = %e, "Planner: unreadable memory record");
                None
            }
        }
    }

    async fn generate(&self, state: &mut JobState) -> EmblemResult<()> {
        let reply = self
            .join(self.request(
                &state.job_id,
                Topic::GenerationResult,
                Payload::GenerationRequest {
                    style_json: state.style_json.clone().unwrap_or_default(),
                    user_text: state.user_text.clone(),
                    structure_spec: state.spec.clone(),
                },
            ))
            .await?;
        let Payload::GenerationResult { best_png, .. } = reply.payload else {
            return Err(unexpected(Topic::GenerationResult, "generation_result"));
        };
        state.best_png = Some(best_png);
        Ok(())
    }

    /// Ask both critics and wait for the arbiter's fused decision.
    async fn review(&self, state: &JobState) -> EmblemResult<ArbiterVerdict> {
        let verdict = self.bus.expect(Topic::ArbiterResult, state.job_id.as_str());
        let request = ReviewRequest {
            image_path: state.best_png.clone().unwrap_or_default(),
            structure_spec: state.spec.clone(),
        };
        self.bus.publish(Message::new(
            state.job_id.as_str(),
            SENDER,
            Payload::StructuralReviewRequest(request.clone()),
        ));
        self.bus.publish(Message::new(
            state.job_id.as_str(),
            SENDER,
            Payload::AestheticReviewRequest(request),
        ));

        match self.join(verdict).await?.payload {
            Payload::ArbiterResult(verdict) => {
                info!(
                    job_id = %state.job_id,
                    round = state.round(),
                    decision = ?verdict.decision,
                    clarity = verdict.review.clarity_score,
                    "Planner: verdict"
                );
                Ok(verdict)
            }
            _ => Err(unexpected(Topic::ArbiterResult, "arbiter_result")),
        }
    }

    async fn refine(&self, state: &mut JobState, verdict: ArbiterVerdict) -> EmblemResult<()> {
        let pending = self.request(
            &state.job_id,
            Topic::DesignResult,
            Payload::DesignRefineRequest {
                prev_style_json: state.style_json.clone().unwrap_or_default(),
                review_json: verdict.review,
                structure_spec: state.spec.clone(),
            },
        );
        self.enter(state, JobPhase::AwaitingDesign).await?;
        state.style_json = Some(style_of(self.join(pending).await?)?);
        Ok(())
    }

    async fn finalize(
        &self,
        state: &mut JobState,
        verdict: ArbiterVerdict,
        outcome: Outcome,
    ) -> EmblemResult<()> {
        self.enter(state, JobPhase::Finalizing).await?;

        let svg_path = match state.best_png.clone().filter(|p| !p.is_empty()) {
            Some(png_path) => {
                let reply = self
                    .join(self.request(
                        &state.job_id,
                        Topic::VectorizationResult,
                        Payload::VectorizationRequest {
                            png_path,
                            method: self.config.vectorize_method.clone(),
                            simplify_eps: self.config.simplify_eps,
                        },
                    ))
                    .await?;
                match reply.payload {
                    Payload::VectorizationResult { svg_path } => svg_path.filter(|p| !p.is_empty()),
                    _ => return Err(unexpected(Topic::VectorizationResult, "vectorization_result")),
                }
            }
            None => {
                warn!(job_id = %state.job_id, "Planner: no candidate to vectorize");
                None
            }
        };

        self.bus.publish(Message::new(
            state.job_id.as_str(),
            SENDER,
            Payload::Completion {
                review: verdict.review,
                svg_path,
                outcome,
                rounds: state.round(),
            },
        ));
        self.enter(state, JobPhase::Done).await
    }

    async fn abort(&self, state: &mut JobState, err: EmblemError) {
        let phase = state.phase();
        let round = state.round();
        error!(
            job_id = %state.job_id,
            phase = %phase,
            round,
            error = %err,
            "Planner: job aborted"
        );
        if let Err(e) = state.transition(JobPhase::Aborted) {
            warn!(job_id = %state.job_id, error = %e, "Planner: abort after terminal phase");
        }
        self.monitor.abort_job(&state.job_id).await;
        self.bus.publish(
            Message::new(
                state.job_id.as_str(),
                SENDER,
                Payload::PipelineError {
                    err: err.to_string(),
                    trace: err.trace(),
                    agent: SENDER.to_string(),
                    phase: Some(phase),
                    round: Some(round),
                },
            )
            .with_error(err.to_string()),
        );
    }
}

fn unexpected(topic: Topic, expected: &'static str) -> EmblemError {
    EmblemError::UnexpectedPayload { topic, expected }
}

fn style_of(reply: Message) -> EmblemResult<String> {
    match reply.payload {
        Payload::DesignResult { style_json } => Ok(style_json),
        _ => Err(unexpected(Topic::DesignResult, "design_result")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::agent::spawn_agent;

    fn quick_config() -> PlannerConfig {
        PlannerConfig {
            required_timeout_secs: 1,
            optional_timeout_secs: 1,
            ..PlannerConfig::default()
        }
    }

    fn intent(job: &str) -> Message {
        Message::new(
            job,
            "test",
            Payload::IntentRequest {
                user_text: "a bridge badge".into(),
                image_path: None,
            },
        )
    }

    async fn next_error(bus: &Bus) -> Message {
        tokio::time::timeout(Duration::from_secs(5), bus.recv(Topic::PipelineError))
            .await
            .expect("pipeline error")
    }

    #[tokio::test]
    async fn test_required_timeout_aborts_with_phase() {
        let bus = Arc::new(Bus::new());
        let planner = Arc::new(Planner::new(bus.clone(), quick_config()));
        let handle = spawn_agent(planner.clone());

        bus.publish(intent("lonely"));
        let err = next_error(&bus).await;
        assert_eq!(err.job_id, "lonely");
        assert!(err.error.is_some());
        match err.payload {
            Payload::PipelineError {
                err, phase, round, agent, ..
            } => {
                assert!(err.contains("Join timeout"));
                assert_eq!(phase, Some(JobPhase::AwaitingGroundSpec));
                assert_eq!(round, Some(1));
                assert_eq!(agent, "Planner");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(planner.monitor().counters().await.aborted, 1);
        assert_eq!(bus.stats().depth(Topic::Completion), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_duplicate_intent_ignored() {
        let bus = Arc::new(Bus::new());
        let planner = Arc::new(Planner::new(bus.clone(), PlannerConfig::default()));
        planner.handle(intent("dup")).await.unwrap();
        planner.handle(intent("dup")).await.unwrap();
        assert_eq!(planner.active_jobs(), 1);
        assert_eq!(planner.monitor().counters().await.started, 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.stats().depth(Topic::GroundingRequest) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.stats().depth(Topic::GroundingRequest), 1);
    }

    #[tokio::test]
    async fn test_wrong_payload_rejected() {
        let bus = Arc::new(Bus::new());
        let planner = Planner::new(bus.clone(), PlannerConfig::default());
        let msg = Message::new(
            "j",
            "test",
            Payload::GroundingRequest {
                user_text: "x".into(),
            },
        );
        let err = planner.handle(msg).await.unwrap_err();
        assert!(matches!(err, EmblemError::UnexpectedPayload { .. }));
    }

    #[tokio::test]
    async fn test_reaper_aborts_stale_jobs() {
        let bus = Arc::new(Bus::new());
        let planner = Arc::new(Planner::new(bus.clone(), PlannerConfig::default()));
        planner.handle(intent("stale")).await.unwrap();
        assert_eq!(planner.monitor().active_count().await, 1);

        assert_eq!(planner.reap_stale(Duration::ZERO).await, 1);
        let err = next_error(&bus).await;
        match err.payload {
            Payload::PipelineError { err, phase, .. } => {
                assert!(err.contains("aborted"));
                assert_eq!(phase, Some(JobPhase::AwaitingGroundSpec));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(planner.monitor().active_count().await, 0);
        assert_eq!(planner.reap_stale(Duration::ZERO).await, 0);

        // The aborted task releases its waiters.
        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.stats().waiters > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_reaper_requires_ttl() {
        let bus = Arc::new(Bus::new());
        let planner = Arc::new(Planner::new(bus.clone(), PlannerConfig::default()));
        assert!(planner.spawn_reaper(Duration::from_millis(10)).is_none());

        let planner = Arc::new(Planner::new(
            bus,
            PlannerConfig {
                job_ttl_secs: Some(60),
                ..PlannerConfig::default()
            },
        ));
        let reaper = planner.spawn_reaper(Duration::from_millis(10)).unwrap();
        reaper.abort();
    }
}
