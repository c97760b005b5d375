use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::payload::Payload;
use crate::topic::Topic;

/// `refs` key linking a derived message to the message that caused it.
pub const IN_REPLY_TO: &str = "in_reply_to";

/// Envelope for everything published on the bus.
///
/// Treated as immutable once published: consumers receive their own copy,
/// and derived data always goes out as a new message built with
/// [`Message::reply`] or [`Message::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Topic, always equal to `payload.topic()`.
    pub topic: Topic,
    /// Job this message belongs to.
    pub job_id: String,
    /// Unique identifier for this message.
    pub corr_id: Uuid,
    /// Name of the publishing agent.
    pub sender: String,
    /// Typed body.
    pub payload: Payload,
    /// Paths, URLs and links to other messages.
    #[serde(default)]
    pub refs: HashMap<String, serde_json::Value>,
    /// Publisher's confidence in the payload, in `[0, 1]`.
    pub confidence: f64,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Error note attached by the publisher.
    #[serde(default)]
    pub error: Option<String>,
}

impl Message {
    /// Creates a new message; the topic is taken from the payload.
    pub fn new(job_id: impl Into<String>, sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: payload.topic(),
            job_id: job_id.into(),
            corr_id: Uuid::new_v4(),
            sender: sender.into(),
            payload,
            refs: HashMap::new(),
            confidence: 1.0,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Creates a message for the same job that records this one as its cause.
    pub fn reply(&self, sender: impl Into<String>, payload: Payload) -> Self {
        Self::new(self.job_id.clone(), sender, payload)
            .with_ref(IN_REPLY_TO, serde_json::Value::String(self.corr_id.to_string()))
    }

    /// Attaches a reference.
    pub fn with_ref(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.refs.insert(key.into(), value);
        self
    }

    /// Sets the confidence, clamped to `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    /// Attaches an error note.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// The `corr_id` of the message this one replies to, if recorded.
    pub fn in_reply_to(&self) -> Option<Uuid> {
        self.refs
            .get(IN_REPLY_TO)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}
