//! Core types and error definitions for the Emblem orchestration engine.
//!
//! This crate provides the foundational types shared by the bus, the control
//! agents and any worker: the message envelope, the topic catalogue, typed
//! payloads, review records and configuration.
//!
//! # Main types
//!
//! - [`EmblemError`]: Unified error enum for all Emblem subsystems.
//! - [`EmblemResult`]: Convenience alias for `Result<T, EmblemError>`.
//! - [`Message`]: Immutable envelope published on the bus.
//! - [`Topic`]: Named channel on the bus.
//! - [`Payload`]: Typed body, one variant per topic.
//! - [`FusedReview`] / [`Thresholds`]: Score fusion output and stop rule.
//! - [`EmblemConfig`]: Planner, arbiter and bus settings.

/// Configuration types with serde defaults.
pub mod config;
/// Entity keys and cross-job memory records.
pub mod entity;
/// Error enum and result alias.
pub mod error;
/// Job phases and outcomes.
pub mod job;
/// Message envelope.
pub mod message;
/// Typed payloads.
pub mod payload;
pub mod review;
/// Topic catalogue.
pub mod topic;

pub use config::{ArbiterConfig, BusConfig, EmblemConfig, OverflowPolicy, PlannerConfig};
pub use entity::{entity_key, store_key, BestStyle, EntityRecord, UNKNOWN_ENTITY};
pub use error::{EmblemError, EmblemResult};
pub use job::{JobPhase, Outcome};
pub use message::Message;
pub use payload::{ArbiterVerdict, Payload, ReviewRequest};
pub use review::{CritiqueKind, CritiqueScores, Decision, FusedReview, Thresholds};
pub use topic::Topic;
