use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::review::FusedReview;

/// Key used for entities whose merged spec names neither a subject nor a place.
pub const UNKNOWN_ENTITY: &str = "unknown";

/// Prefix of entity records in the bus long-term store.
pub const STYLE_KEY_PREFIX: &str = "style:";

/// Computes the normalized `"<name>|<location>"` key of a merged spec.
///
/// Reads `entity.name` and `entity.location`; both are trimmed and
/// lower-cased. Falls back to [`UNKNOWN_ENTITY`] when both are empty.
pub fn entity_key(merged_spec: &serde_json::Value) -> String {
    let entity = merged_spec.get("entity");
    let field = |name: &str| -> String {
        entity
            .and_then(|e| e.get(name))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            })
            .unwrap_or_default()
            .trim()
            .to_lowercase()
    };
    let name = field("name");
    let location = field("location");
    if name.is_empty() && location.is_empty() {
        UNKNOWN_ENTITY.to_string()
    } else {
        format!("{name}|{location}")
    }
}

/// Long-term store key for an entity key.
pub fn store_key(entity_key: &str) -> String {
    format!("{STYLE_KEY_PREFIX}{entity_key}")
}

/// The converged style committed for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestStyle {
    /// Style descriptor that passed the arbiter.
    pub style_json: String,
    /// Fused review that produced the `stop` decision.
    pub review: FusedReview,
    /// Commit time.
    pub updated_at: DateTime<Utc>,
}

/// Cross-job memory for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Last style that converged for this entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<BestStyle>,
    /// Most recent vector artifact produced for this entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_svg: Option<String>,
}
