//! Story records pushed to story subscribers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A story as delivered on `story-updated`.
///
/// Only the identifier is interpreted here; everything else is carried through
/// untouched for the observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryDetail {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StoryDetail {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }
}
