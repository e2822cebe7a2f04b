//! Storage interception.
//!
//! An explicit pre-commit hook the application's persistence layer calls
//! with the entity type and field values it is about to write. Matching is
//! two-tiered: tracked fields that were tagged under the same name in the
//! current request match directly, everything else falls back to
//! fingerprint matching against the request scope and the global registry.
//!
//! Tracked personal fields are re-registered on every write so values that
//! reach storage through transformations (or arrive without a request
//! scope, from jobs and fixtures) stay matchable at egress later.
//!
//! Fail-open: nothing here can make the application's write fail.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::FieldConfig;
use crate::context::RequestScope;
use crate::engine::ProvenanceEngine;
use crate::payload::{is_non_empty, preview_value};
use crate::tag::{DataTag, EventKind, ProvenanceEvent};

/// The write kinds the persistence hook distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Insert,
    Update,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::Insert => "insert",
            WriteOperation::Update => "update",
        }
    }
}

impl std::fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observes persistence-layer writes for tracked entity types.
#[derive(Debug, Clone)]
pub struct StorageInterceptor {
    engine: Arc<ProvenanceEngine>,
}

impl StorageInterceptor {
    pub fn new(engine: Arc<ProvenanceEngine>) -> Self {
        Self { engine }
    }

    /// Record the tracked fields of one entity write. `fields` is the
    /// about-to-be-written column map as JSON; untracked entity types are a
    /// no-op. Emits one STORAGE event per tracked field that carries a
    /// value.
    pub fn observe_write(
        &self,
        scope: Option<&RequestScope>,
        model: &str,
        operation: WriteOperation,
        instance_id: Option<&str>,
        fields: &Value,
    ) {
        let Some(model_config) = self.engine.config().tracked_models.get(model) else {
            return;
        };
        let Some(values) = fields.as_object() else {
            tracing::warn!(model, "storage hook called with a non-object field map");
            return;
        };

        for (field, rule) in &model_config.fields {
            let Some(value) = values.get(field) else {
                continue;
            };
            if !is_non_empty(value) {
                continue;
            }
            let owner = rule
                .owner_attribute
                .as_deref()
                .and_then(|attr| values.get(attr))
                .and_then(stringify);
            self.observe_field(
                scope,
                model,
                operation,
                instance_id,
                field,
                rule,
                value,
                owner,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn observe_field(
        &self,
        scope: Option<&RequestScope>,
        model: &str,
        operation: WriteOperation,
        instance_id: Option<&str>,
        field: &str,
        rule: &FieldConfig,
        value: &Value,
        owner: Option<String>,
    ) {
        let mut matched = self.match_field(scope, model, field, value);

        if rule.personal {
            let tag = self.register_persisted(scope, model, field, rule, value, owner.clone());
            if !matched.iter().any(|t| t.fingerprint == tag.fingerprint) {
                matched.push(tag);
            }
        }

        let preview = preview_value(value, self.engine.config().preview_max_len);
        let event = ProvenanceEvent::new(
            EventKind::Storage,
            model,
            format!("{operation} {model}"),
        )
        .with_payload(json!({
            "operation": operation.as_str(),
            "model": model,
            "field": field,
            "instance_id": instance_id,
            "preview": preview,
        }))
        .with_request(
            scope.map(RequestScope::request_id),
            scope.and_then(RequestScope::user_id).or(owner.clone()),
        )
        .with_matched_tags(matched)
        .with_extras(json!({ "owner": owner }));
        self.engine.record_event(&event);
    }

    /// Tier 1: tags registered under the same field name (bare or
    /// model-qualified) in the current request. The name link deliberately
    /// survives re-encoding between ingress and the write (hashed
    /// passwords, normalized values), which a fingerprint alone cannot.
    /// Tier 2: fingerprint match against the scope and the global registry.
    fn match_field(
        &self,
        scope: Option<&RequestScope>,
        model: &str,
        field: &str,
        value: &Value,
    ) -> Vec<DataTag> {
        if let Some(scope) = scope {
            let mut by_name = scope.find_by_field(field);
            if by_name.is_empty() {
                by_name = scope.find_by_field(&format!("{model}.{field}"));
            }
            if !by_name.is_empty() {
                return by_name;
            }
        }
        self.engine.match_payload(scope, value)
    }

    fn register_persisted(
        &self,
        scope: Option<&RequestScope>,
        model: &str,
        field: &str,
        rule: &FieldConfig,
        value: &Value,
        owner: Option<String>,
    ) -> DataTag {
        let qualified = format!("{model}.{field}");
        let source = format!("model:{model}");
        match scope {
            Some(scope) => {
                let tag = scope.register(
                    &qualified,
                    &rule.category,
                    &rule.description,
                    value,
                    owner,
                    &source,
                    self.engine.config().preview_max_len,
                );
                self.engine.promote(&tag, None);
                tag
            }
            None => {
                let tag = DataTag::for_value(
                    value,
                    qualified,
                    &rule.category,
                    &rule.description,
                    owner,
                    source,
                    self.engine.config().preview_max_len,
                );
                self.engine.promote(&tag, None);
                tag
            }
        }
    }
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
