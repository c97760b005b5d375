use crate::agent::{Agent, Subscription};
use crate::bus::Bus;
use crate::planner::is_job_abort;
use async_trait::async_trait;
use chrono::Utc;
use emblem_core::{
    entity_key, store_key, ArbiterVerdict, BestStyle, Decision, EmblemResult, EntityRecord,
    Message, Payload, Topic, UNKNOWN_ENTITY,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Cross-job cache of the best converged style per entity.
///
/// Observes results without consuming them. Per-job entity and style
/// mappings are scratch; only a `stop` decision promotes a style into the
/// long-term store. This agent is the store's only writer.
pub struct MemoryAgent {
    bus: Arc<Bus>,
    job_entities: Mutex<HashMap<String, String>>,
    job_styles: Mutex<HashMap<String, String>>,
}

impl MemoryAgent {
    /// Memory agent writing to `bus`'s long-term store.
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            job_entities: Mutex::new(HashMap::new()),
            job_styles: Mutex::new(HashMap::new()),
        }
    }

    /// Read an entity's record back from the bus store.
    pub fn record(bus: &Bus, entity_key: &str) -> EmblemResult<Option<EntityRecord>> {
        bus.mem_get(&store_key(entity_key))
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// Entity a job was mapped to, if its merge result was seen.
    pub fn entity_of(&self, job_id: &str) -> Option<String> {
        self.job_entities.lock().get(job_id).cloned()
    }

    fn load(&self, key: &str) -> EmblemResult<EntityRecord> {
        Ok(Self::record(&self.bus, key)?.unwrap_or_default())
    }

    fn save(&self, key: &str, record: &EntityRecord) -> EmblemResult<()> {
        self.bus.mem_set(store_key(key), serde_json::to_value(record)?);
        Ok(())
    }

    fn forget(&self, job_id: &str) {
        self.job_entities.lock().remove(job_id);
        self.job_styles.lock().remove(job_id);
    }

    fn on_merge(&self, job_id: &str, merged: &serde_json::Value) -> EmblemResult<()> {
        let key = entity_key(merged);
        debug!(job_id = %job_id, entity = %key, "Memory: job mapped to entity");
        self.job_entities
            .lock()
            .insert(job_id.to_string(), key.clone());

        if Self::record(&self.bus, &key)?.is_none() {
            self.save(&key, &EntityRecord::default())?;
        }
        Ok(())
    }

    fn on_verdict(&self, job_id: &str, verdict: &ArbiterVerdict) -> EmblemResult<()> {
        if verdict.decision != Decision::Stop {
            return Ok(());
        }
        let Some(style_json) = self.job_styles.lock().get(job_id).cloned() else {
            debug!(job_id = %job_id, "Memory: stop without a recorded style, nothing to commit");
            return Ok(());
        };
        let key = self
            .entity_of(job_id)
            .unwrap_or_else(|| UNKNOWN_ENTITY.to_string());

        let mut record = self.load(&key)?;
        record.best = Some(BestStyle {
            style_json,
            review: verdict.review.clone(),
            updated_at: Utc::now(),
        });
        self.save(&key, &record)?;
        info!(job_id = %job_id, entity = %key, "Memory: committed best style");
        Ok(())
    }

    fn on_artifact(&self, job_id: &str, svg_path: &str) -> EmblemResult<()> {
        let Some(key) = self.entity_of(job_id) else {
            return Ok(());
        };
        let mut record = self.load(&key)?;
        if record.latest_svg.as_deref() != Some(svg_path) {
            record.latest_svg = Some(svg_path.to_string());
            self.save(&key, &record)?;
            debug!(job_id = %job_id, entity = %key, svg = %svg_path, "Memory: latest artifact");
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for MemoryAgent {
    fn name(&self) -> &str {
        "Memory"
    }

    fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::Observe(Topic::MergeResult),
            Subscription::Observe(Topic::DesignResult),
            Subscription::Observe(Topic::ArbiterResult),
            Subscription::Observe(Topic::VectorizationResult),
            Subscription::Observe(Topic::Completion),
            Subscription::Observe(Topic::PipelineError),
        ]
    }

    async fn handle(&self, msg: Message) -> EmblemResult<()> {
        match &msg.payload {
            Payload::MergeResult { merged } => self.on_merge(&msg.job_id, merged),
            Payload::DesignResult { style_json } => {
                if !style_json.is_empty() {
                    self.job_styles
                        .lock()
                        .insert(msg.job_id.clone(), style_json.clone());
                }
                Ok(())
            }
            Payload::ArbiterResult(verdict) => self.on_verdict(&msg.job_id, verdict),
            Payload::VectorizationResult { svg_path } => match svg_path {
                Some(path) if !path.is_empty() => self.on_artifact(&msg.job_id, path),
                _ => Ok(()),
            },
            Payload::Completion { svg_path, .. } => {
                // Usually already recorded from the vectorization result.
                if let Some(path) = svg_path.as_deref().filter(|p| !p.is_empty()) {
                    self.on_artifact(&msg.job_id, path)?;
                }
                self.forget(&msg.job_id);
                Ok(())
            }
            Payload::PipelineError { .. } if is_job_abort(&msg) => {
                debug!(job_id = %msg.job_id, "Memory: job aborted, scratch dropped");
                self.forget(&msg.job_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
