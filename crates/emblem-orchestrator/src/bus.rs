use emblem_core::{BusConfig, EmblemError, EmblemResult, Message, OverflowPolicy, Topic};
use futures_util::stream::{self, Stream};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// FIFO queue for one topic, shared by competing consumers.
struct TopicQueue {
    items: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl TopicQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Appends a message; returns whatever had to be dropped to respect the
    /// capacity bound.
    fn push(&self, msg: Message, config: &BusConfig) -> Option<Message> {
        let dropped = {
            let mut items = self.items.lock();
            match config.queue_capacity {
                Some(cap) if items.len() >= cap => match config.overflow {
                    OverflowPolicy::DropOldest => {
                        let oldest = items.pop_front();
                        items.push_back(msg);
                        oldest
                    }
                    OverflowPolicy::DropNewest => Some(msg),
                },
                _ => {
                    items.push_back(msg);
                    None
                }
            }
        };
        self.notify.notify_one();
        dropped
    }

    async fn recv(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.items.lock().pop_front() {
                return msg;
            }
            notified.await;
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

struct Waiter {
    token: u64,
    tx: oneshot::Sender<Message>,
}

/// Topic-based publish/subscribe bus with a long-term key/value store.
///
/// Three delivery paths exist per topic:
/// - observers (`observe`) each get a copy of every message;
/// - a job-keyed waiter registered with [`Bus::expect`] takes the message
///   addressed to its job;
/// - everything else lands in the topic's FIFO queue and goes to exactly
///   one `subscribe` consumer. On routed reply topics there is no queue:
///   a message nobody waits for is an orphan and is dropped.
pub struct Bus {
    config: BusConfig,
    queues: RwLock<HashMap<Topic, Arc<TopicQueue>>>,
    observers: RwLock<HashMap<Topic, Vec<mpsc::UnboundedSender<Message>>>>,
    waiters: Mutex<HashMap<(Topic, String), Waiter>>,
    store: RwLock<HashMap<String, serde_json::Value>>,
    next_token: AtomicU64,
    orphaned: AtomicU64,
    dropped: AtomicU64,
}

impl Bus {
    /// Create an unbounded bus.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with explicit queue settings.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            config,
            queues: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            store: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            orphaned: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn queue(&self, topic: Topic) -> Arc<TopicQueue> {
        if let Some(q) = self.queues.read().get(&topic) {
            return q.clone();
        }
        self.queues
            .write()
            .entry(topic)
            .or_insert_with(|| Arc::new(TopicQueue::new()))
            .clone()
    }

    /// Publish a message. Never blocks and never fails.
    pub fn publish(&self, msg: Message) {
        debug!(
            topic = %msg.topic,
            job_id = %msg.job_id,
            sender = %msg.sender,
            corr_id = %msg.corr_id,
            "Bus: publish"
        );

        if let Some(senders) = self.observers.write().get_mut(&msg.topic) {
            senders.retain(|tx| tx.send(msg.clone()).is_ok());
        }

        let waiter = self.waiters.lock().remove(&(msg.topic, msg.job_id.clone()));
        let msg = match waiter {
            Some(waiter) => match waiter.tx.send(msg) {
                Ok(()) => return,
                Err(msg) => msg,
            },
            None => msg,
        };

        if msg.topic.is_routed() {
            self.orphaned.fetch_add(1, Ordering::Relaxed);
            warn!(
                topic = %msg.topic,
                job_id = %msg.job_id,
                sender = %msg.sender,
                "Bus: dropping orphaned reply, no job is waiting for it"
            );
            return;
        }

        let topic = msg.topic;
        if let Some(dropped) = self.queue(topic).push(msg, &self.config) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                topic = %topic,
                job_id = %dropped.job_id,
                policy = ?self.config.overflow,
                "Bus: queue full, message dropped"
            );
        }
    }

    /// Non-terminating stream of queued messages on `topic`.
    ///
    /// Competing-consumer semantics: every queued message is yielded to
    /// exactly one of the streams reading the topic, in publish order.
    pub fn subscribe(&self, topic: Topic) -> impl Stream<Item = Message> + Send + 'static {
        let queue = self.queue(topic);
        stream::unfold(queue, |q| async move {
            let msg = q.recv().await;
            Some((msg, q))
        })
    }

    /// Receive the next queued message on `topic`.
    pub async fn recv(&self, topic: Topic) -> Message {
        self.queue(topic).recv().await
    }

    /// Passive stream receiving a copy of every message published on `topic`
    /// from now on, regardless of who consumes it.
    pub fn observe(&self, topic: Topic) -> UnboundedReceiverStream<Message> {
        self.observe_topics(&[topic])
    }

    /// Passive stream over several topics, in publish order across all of them.
    pub fn observe_topics(&self, topics: &[Topic]) -> UnboundedReceiverStream<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observers = self.observers.write();
        for topic in topics {
            observers.entry(*topic).or_default().push(tx.clone());
        }
        UnboundedReceiverStream::new(rx)
    }

    /// Register interest in the next `topic` message for `job_id`.
    ///
    /// Must be called before the request that triggers the reply is
    /// published. A second registration for the same key replaces the first.
    pub fn expect(self: &Arc<Self>, topic: Topic, job_id: impl Into<String>) -> PendingReply {
        let job_id = job_id.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let replaced = self
            .waiters
            .lock()
            .insert((topic, job_id.clone()), Waiter { token, tx });
        if replaced.is_some() {
            warn!(topic = %topic, job_id = %job_id, "Bus: replacing an existing waiter");
        }
        PendingReply {
            bus: Arc::clone(self),
            topic,
            job_id,
            token,
            rx,
        }
    }

    fn release_waiter(&self, topic: Topic, job_id: &str, token: u64) {
        let mut waiters = self.waiters.lock();
        let key = (topic, job_id.to_string());
        if waiters.get(&key).is_some_and(|w| w.token == token) {
            waiters.remove(&key);
        }
    }

    /// Read a value from the long-term store.
    pub fn mem_get(&self, key: &str) -> Option<serde_json::Value> {
        self.store.read().get(key).cloned()
    }

    /// Read a value, falling back to `default` when the key is absent.
    pub fn mem_get_or(&self, key: &str, default: serde_json::Value) -> serde_json::Value {
        self.mem_get(key).unwrap_or(default)
    }

    /// Write a value to the long-term store.
    pub fn mem_set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.store.write().insert(key.into(), value);
    }

    /// Keys currently held in the long-term store.
    pub fn mem_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.store.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Queue depths and drop counters.
    pub fn stats(&self) -> BusStats {
        let depths = self
            .queues
            .read()
            .iter()
            .map(|(topic, q)| (*topic, q.len()))
            .collect();
        BusStats {
            depths,
            waiters: self.waiters.lock().len(),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of bus queue state.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    /// Queued (unconsumed) messages per topic.
    pub depths: BTreeMap<Topic, usize>,
    /// Registered job waiters.
    pub waiters: usize,
    /// Replies dropped because no job was waiting.
    pub orphaned: u64,
    /// Messages dropped by the overflow policy.
    pub dropped: u64,
}

impl BusStats {
    /// Queued messages on one topic.
    pub fn depth(&self, topic: Topic) -> usize {
        self.depths.get(&topic).copied().unwrap_or(0)
    }
}

/// A registered single-shot wait for one job's reply on one topic.
///
/// Dropping it (including after a timeout) deregisters the waiter, so a late
/// reply becomes an orphan instead of being held forever.
pub struct PendingReply {
    bus: Arc<Bus>,
    topic: Topic,
    job_id: String,
    token: u64,
    rx: oneshot::Receiver<Message>,
}

impl PendingReply {
    /// Topic being waited on.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> EmblemResult<Message> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(EmblemError::Bus(format!(
                "waiter for {} / job {} was replaced",
                self.topic, self.job_id
            ))),
            Err(_) => Err(EmblemError::JoinTimeout {
                topic: self.topic,
                job_id: self.job_id.clone(),
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.bus.release_waiter(self.topic, &self.job_id, self.token);
    }
}
