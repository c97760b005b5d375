use crate::bus::Bus;
use async_trait::async_trait;
use emblem_core::{EmblemResult, Message, Payload, Topic};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How an agent reads a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// Compete with other consumers for queued messages.
    Consume(Topic),
    /// Receive a copy of every message without consuming it.
    Observe(Topic),
}

impl Subscription {
    /// The topic read.
    pub fn topic(&self) -> Topic {
        match self {
            Subscription::Consume(t) | Subscription::Observe(t) => *t,
        }
    }
}

/// A named participant on the bus.
///
/// Implementors only provide `handle`; [`spawn_agent`] runs the consumption
/// loops and turns handler failures into `pipeline.error` messages.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Name used as `sender` and in error reports.
    fn name(&self) -> &str;

    /// The bus this agent publishes to and reads from.
    fn bus(&self) -> &Arc<Bus>;

    /// Topics read by this agent.
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Process one message.
    async fn handle(&self, msg: Message) -> EmblemResult<()>;
}

/// Running consumption loops of one agent.
pub struct AgentHandle {
    name: String,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of running loops.
    pub fn loop_count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every loop has ended.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Stop all loops.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Start the consumption loops of `agent`.
///
/// Each consumed topic gets its own concurrent loop. All observed topics
/// share a single loop so the agent sees them in publish order.
pub fn spawn_agent<A: Agent>(agent: Arc<A>) -> AgentHandle {
    let subscriptions = agent.subscriptions();
    info!(
        agent = %agent.name(),
        topics = ?subscriptions.iter().map(|s| s.topic().as_str()).collect::<Vec<_>>(),
        "Agent: starting"
    );

    let observed: Vec<Topic> = subscriptions
        .iter()
        .filter(|s| matches!(s, Subscription::Observe(_)))
        .map(Subscription::topic)
        .collect();
    let mut streams: Vec<BoxStream<'static, Message>> = subscriptions
        .iter()
        .filter_map(|s| match s {
            Subscription::Consume(topic) => Some(agent.bus().subscribe(*topic).boxed()),
            Subscription::Observe(_) => None,
        })
        .collect();
    if !observed.is_empty() {
        streams.push(agent.bus().observe_topics(&observed).boxed());
    }

    let tasks = streams
        .into_iter()
        .map(|stream| tokio::spawn(consume(agent.clone(), stream)))
        .collect();
    AgentHandle {
        name: agent.name().to_string(),
        tasks,
    }
}

async fn consume<A: Agent>(agent: Arc<A>, mut stream: BoxStream<'static, Message>) {
    while let Some(msg) = stream.next().await {
        let job_id = msg.job_id.clone();
        let topic = msg.topic;

        let failure = match AssertUnwindSafe(agent.handle(msg)).catch_unwind().await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => (e.to_string(), e.trace()),
            Err(panic) => {
                let text = panic_text(panic.as_ref());
                (format!("handler panicked: {text}"), format!("panic in {topic} handler: {text}"))
            }
        };

        let (err, trace) = failure;
        error!(
            agent = %agent.name(),
            topic = %topic,
            job_id = %job_id,
            error = %err,
            "Agent: handler failed, message dropped"
        );

        // Reporting a failure to handle an error report would feed itself.
        if topic == Topic::PipelineError {
            continue;
        }

        agent.bus().publish(
            Message::new(
                job_id,
                agent.name(),
                Payload::PipelineError {
                    err: err.clone(),
                    trace,
                    agent: agent.name().to_string(),
                    phase: None,
                    round: None,
                },
            )
            .with_error(err),
        );
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use emblem_core::EmblemError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails on "fail", panics on "panic", counts everything else.
    struct FlakyAgent {
        bus: Arc<Bus>,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn name(&self) -> &str {
            "Flaky"
        }

        fn bus(&self) -> &Arc<Bus> {
            &self.bus
        }

        fn subscriptions(&self) -> Vec<Subscription> {
            vec![
                Subscription::Consume(Topic::GroundingRequest),
                Subscription::Consume(Topic::DetectionRequest),
            ]
        }

        async fn handle(&self, msg: Message) -> EmblemResult<()> {
            if let Payload::GroundingRequest { user_text } = &msg.payload {
                match user_text.as_str() {
                    "fail" => return Err(EmblemError::Agent("cannot ground".into())),
                    "panic" => panic!("grounder exploded"),
                    _ => {}
                }
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request(job: &str, text: &str) -> Message {
        Message::new(
            job,
            "test",
            Payload::GroundingRequest {
                user_text: text.into(),
            },
        )
    }

    async fn next_error(bus: &Bus) -> Message {
        tokio::time::timeout(Duration::from_secs(2), bus.recv(Topic::PipelineError))
            .await
            .expect("error message")
    }

    #[tokio::test]
    async fn test_one_loop_per_subscription() {
        let bus = Arc::new(Bus::new());
        let agent = Arc::new(FlakyAgent {
            bus: bus.clone(),
            handled: AtomicUsize::new(0),
        });
        let handle = spawn_agent(agent.clone());
        assert_eq!(handle.loop_count(), 2);
        assert_eq!(handle.name(), "Flaky");

        bus.publish(request("j1", "ok"));
        bus.publish(Message::new(
            "j2",
            "test",
            Payload::DetectionRequest {
                image_path: "a.jpg".into(),
                schema: "{}".into(),
            },
        ));
        tokio::time::timeout(Duration::from_secs(2), async {
            while agent.handled.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn test_handler_error_published_and_loop_survives() {
        let bus = Arc::new(Bus::new());
        let agent = Arc::new(FlakyAgent {
            bus: bus.clone(),
            handled: AtomicUsize::new(0),
        });
        let handle = spawn_agent(agent.clone());

        bus.publish(request("job-err", "fail"));
        let err = next_error(&bus).await;
        assert_eq!(err.job_id, "job-err");
        assert_eq!(err.sender, "Flaky");
        match &err.payload {
            Payload::PipelineError {
                err, agent, trace, ..
            } => {
                assert_eq!(err, "Agent error: cannot ground");
                assert_eq!(agent, "Flaky");
                assert!(trace.contains("cannot ground"));
            }
            other => panic!("unexpected payload {other:?}"),
        }

        bus.publish(request("job-ok", "fine"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while agent.handled.load(Ordering::SeqCst) < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let bus = Arc::new(Bus::new());
        let agent = Arc::new(FlakyAgent {
            bus: bus.clone(),
            handled: AtomicUsize::new(0),
        });
        let handle = spawn_agent(agent);

        bus.publish(request("job-panic", "panic"));
        let err = next_error(&bus).await;
        match &err.payload {
            Payload::PipelineError { err, .. } => assert!(err.contains("grounder exploded")),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(!handle.is_finished());
        handle.abort();
    }
}
