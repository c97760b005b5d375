use crate::topic::Topic;
use thiserror::Error;

/// A convenience `Result` alias using [`EmblemError`].
pub type EmblemResult<T> = Result<T, EmblemError>;

/// Top-level error type for the Emblem orchestration engine.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Error, Debug)]
pub enum EmblemError {
    /// An agent's handler could not process a message.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A bus-level failure (closed waiter, duplicate registration).
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A required per-job reply did not arrive in time.
    #[error("Join timeout: no {topic} for job {job_id} after {waited_ms}ms")]
    JoinTimeout {
        /// Topic the planner was waiting on.
        topic: Topic,
        /// Job the reply was expected for.
        job_id: String,
        /// How long the wait lasted.
        waited_ms: u64,
    },

    /// A message arrived on a topic with a payload of the wrong shape.
    #[error("Unexpected payload on {topic}: expected {expected}")]
    UnexpectedPayload {
        /// Topic of the offending message.
        topic: Topic,
        /// Name of the payload variant the receiver required.
        expected: &'static str,
    },

    /// A job task was stopped before reaching a terminal decision.
    #[error("Job {0} aborted")]
    JobAborted(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmblemError {
    /// Returns `true` for failures caused by a missing reply rather than a
    /// broken handler.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EmblemError::JoinTimeout { .. })
    }

    /// Renders the error together with its `source()` chain, one cause per
    /// line. Used as the diagnostic trace on `pipeline.error`.
    pub fn trace(&self) -> String {
        let mut out = format!("{self}");
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}
