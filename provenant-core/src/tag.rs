//! Tag and event model: the records everything else produces and consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::fingerprint::fingerprint_value;
use crate::payload::preview_value;

/// Provenance metadata bound to a fingerprint. Two equal values anywhere in
/// the system produce the same fingerprint and therefore match the same tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTag {
    /// Content fingerprint of the tagged value.
    pub fingerprint: String,
    /// Field name the value arrived under (e.g. `email`, `User.income`).
    pub field: String,
    /// Data category (e.g. `contact.email`, `financial.income`).
    pub category: String,
    /// Human-readable description from configuration.
    pub description: String,
    /// The principal this data belongs to, when known.
    pub owner: Option<String>,
    /// Where the value entered the system (e.g. `HTTP POST /signup`).
    pub source: String,
    /// Truncated preview of the tagged value.
    pub preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DataTag {
    /// Build a tag for `value`, computing its fingerprint and preview.
    pub fn for_value(
        value: &Value,
        field: impl Into<String>,
        category: impl Into<String>,
        description: impl Into<String>,
        owner: Option<String>,
        source: impl Into<String>,
        preview_max_len: usize,
    ) -> Self {
        Self {
            fingerprint: fingerprint_value(value),
            field: field.into(),
            category: category.into(),
            description: description.into(),
            owner,
            source: source.into(),
            preview: Some(preview_value(value, preview_max_len)),
            created_at: Utc::now(),
        }
    }
}

/// The three observations the engine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Tagged data entered through a request boundary.
    Ingress,
    /// Tagged data was written by the persistence layer.
    Storage,
    /// Data was transmitted to an external destination.
    Share,
}

impl EventKind {
    /// Stable string tag used in the store and query filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ingress => "ingress",
            EventKind::Storage => "storage",
            EventKind::Share => "share",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingress" => Some(EventKind::Ingress),
            "storage" => Some(EventKind::Storage),
            "share" => Some(EventKind::Share),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded observation. Immutable once recorded; the store is
/// append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub event_id: Uuid,
    pub kind: EventKind,
    /// Component that produced the observation (model name, client name).
    pub actor: String,
    /// What was acted on: request path, write operation, destination origin.
    pub target: String,
    /// Event-specific detail, log-safe (previews only, never raw payloads).
    pub payload: Value,
    pub request_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub matched_tags: Vec<DataTag>,
    /// Free-form extension data (error text, owner attribution).
    pub extras: Value,
    pub created_at: DateTime<Utc>,
}

impl ProvenanceEvent {
    pub fn new(kind: EventKind, actor: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            actor: actor.into(),
            target: target.into(),
            payload: Value::Null,
            request_id: None,
            user_id: None,
            matched_tags: Vec::new(),
            extras: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_request(mut self, request_id: Option<Uuid>, user_id: Option<String>) -> Self {
        self.request_id = request_id;
        self.user_id = user_id;
        self
    }

    pub fn with_matched_tags(mut self, tags: Vec<DataTag>) -> Self {
        self.matched_tags = tags;
        self
    }

    pub fn with_extras(mut self, extras: Value) -> Self {
        self.extras = extras;
        self
    }

    /// Owner identifiers associated with this event: the request's user plus
    /// every matched tag's owner, deduplicated and sorted.
    pub fn owner_identifiers(&self) -> Vec<String> {
        let mut owners: Vec<String> = self
            .matched_tags
            .iter()
            .filter_map(|t| t.owner.clone())
            .chain(self.user_id.clone())
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }
}
