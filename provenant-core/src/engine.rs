//! The provenance engine.
//!
//! One engine exists per process, shared behind an `Arc` by the ingress
//! middleware, the storage interceptor, the egress client, and the audit
//! API. It owns the validated config, the global tag registry, and the
//! durable audit store.
//!
//! Everything past construction is fail-open: a storage hiccup while
//! recording an observation is logged and dropped, never surfaced to the
//! application request that triggered it.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::{EngineConfig, InputFieldConfig};
use crate::context::{RequestContext, RequestScope};
use crate::error::ProvenantError;
use crate::fingerprint::fingerprint_value;
use crate::payload::{flatten_value, is_non_empty};
use crate::registry::GlobalRegistry;
use crate::store::{
    AuditStore, EventFilter, FingerprintRecord, OwnerReport, SharingPattern, SharingSummary,
    StoreStats,
};
use crate::tag::{DataTag, ProvenanceEvent};

/// Snapshot returned by the status endpoint and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: String,
    pub storage_path: String,
    /// Configured ingress field names, sorted.
    pub input_fields: Vec<String>,
    /// Tracked entity types and their tracked field names, sorted.
    pub tracked_models: BTreeMap<String, Vec<String>>,
    pub registry_size: usize,
    pub suspicious_threshold: usize,
    pub suspicious_window_hours: i64,
    pub store: StoreStats,
}

pub struct ProvenanceEngine {
    config: EngineConfig,
    registry: GlobalRegistry,
    store: AuditStore,
}

impl std::fmt::Debug for ProvenanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvenanceEngine")
            .field("storage_path", &self.config.storage_path)
            .finish()
    }
}

impl ProvenanceEngine {
    /// Build an engine from a validated config, opening the audit store at
    /// the configured path.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, ProvenantError> {
        config.validate()?;
        let store = AuditStore::open(&config.storage_path)?;
        Ok(Arc::new(Self {
            config,
            registry: GlobalRegistry::new(),
            store,
        }))
    }

    /// Build an engine over an existing store. Used by tests.
    pub fn with_store(config: EngineConfig, store: AuditStore) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: GlobalRegistry::new(),
            store,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &AuditStore {
        &self.store
    }

    pub fn registry(&self) -> &GlobalRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------
    // Request lifecycle
    // -----------------------------------------------------------------

    /// Open a request scope and record the request in the ledger.
    pub fn begin_request(
        &self,
        method: &str,
        path: &str,
        client_ip: Option<String>,
        user_id: Option<String>,
    ) -> RequestScope {
        let context = RequestContext::new(method, path)
            .with_client_ip(client_ip)
            .with_user(user_id);
        let scope = RequestScope::new(context);
        if let Err(e) = self.store.record_request_start(
            scope.request_id(),
            method,
            path,
            scope.client_ip().as_deref(),
            scope.user_id().as_deref(),
            scope.started_at(),
        ) {
            tracing::warn!(error = %e, "failed to record request start");
        }
        scope
    }

    /// Finalize the request's ledger row.
    pub fn finish_request(&self, scope: &RequestScope, status: Option<u16>, error: Option<&str>) {
        if let Err(e) = self.store.record_request_end(
            scope.request_id(),
            status,
            scope.user_id().as_deref(),
            error,
            Utc::now(),
        ) {
            tracing::warn!(error = %e, "failed to record request end");
        }
    }

    // -----------------------------------------------------------------
    // Tagging and matching
    // -----------------------------------------------------------------

    /// Tag an ingress value: register in the request scope, promote into the
    /// global registry, and persist the fingerprint record.
    pub fn register_input(
        &self,
        scope: &RequestScope,
        field: &str,
        rule: &InputFieldConfig,
        value: &Value,
        source: &str,
    ) -> DataTag {
        let tag = scope.register(
            field,
            &rule.category,
            &rule.description,
            value,
            scope.user_id(),
            source,
            self.config.preview_max_len,
        );
        self.promote(&tag, None);
        tag
    }

    /// Promote a tag into the global registry and the durable fingerprint
    /// table. First registration of a fingerprint wins; later ones only
    /// refresh the stored record.
    pub fn promote(&self, tag: &DataTag, event_id: Option<uuid::Uuid>) {
        self.registry.insert(tag.clone());
        if let Err(e) = self.store.upsert_fingerprint(tag, event_id) {
            tracing::warn!(error = %e, fingerprint = %tag.fingerprint, "failed to persist fingerprint");
        }
    }

    /// Match every leaf value of `payload` against known tags: the request
    /// scope first, then the global registry. Returns each matched tag once,
    /// in payload order, scope matches before registry matches.
    pub fn match_payload(&self, scope: Option<&RequestScope>, payload: &Value) -> Vec<DataTag> {
        let mut fingerprints = Vec::new();
        let mut seen = HashSet::new();
        for (_, leaf) in flatten_value(payload) {
            if !is_non_empty(&leaf) {
                continue;
            }
            let fingerprint = fingerprint_value(&leaf);
            if seen.insert(fingerprint.clone()) {
                fingerprints.push(fingerprint);
            }
        }

        let mut matched = Vec::new();
        let mut matched_fps: HashSet<String> = HashSet::new();
        if let Some(scope) = scope {
            for tag in scope.find(&fingerprints) {
                if matched_fps.insert(tag.fingerprint.clone()) {
                    matched.push(tag);
                }
            }
        }
        let remaining: Vec<String> = fingerprints
            .into_iter()
            .filter(|f| !matched_fps.contains(f))
            .collect();
        for tag in self.registry.matching(&remaining) {
            if matched_fps.insert(tag.fingerprint.clone()) {
                matched.push(tag);
            }
        }
        matched
    }

    // -----------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------

    /// Persist an observation. A failed write is retried once, then the
    /// event is dropped with a warning. The caller's request never fails
    /// because of the audit trail.
    pub fn record_event(&self, event: &ProvenanceEvent) {
        for tag in &event.matched_tags {
            self.promote(tag, Some(event.event_id));
        }
        if let Err(first) = self.store.record_event(event) {
            tracing::debug!(error = %first, event_id = %event.event_id, "event write failed, retrying");
            if let Err(e) = self.store.record_event(event) {
                tracing::warn!(
                    error = %e,
                    event_id = %event.event_id,
                    kind = %event.kind,
                    "dropping audit event after retry"
                );
            }
        }
    }

    // -----------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------

    pub fn fetch_events(&self, filter: &EventFilter) -> crate::error::Result<Vec<ProvenanceEvent>> {
        Ok(self.store.fetch_events(filter)?)
    }

    pub fn fetch_fingerprints(&self) -> crate::error::Result<Vec<FingerprintRecord>> {
        Ok(self.store.fetch_fingerprints()?)
    }

    pub fn summarize(&self) -> crate::error::Result<SharingSummary> {
        Ok(self.store.summarize(self.detection_window())?)
    }

    pub fn detect_suspicious(&self) -> crate::error::Result<Vec<SharingPattern>> {
        Ok(self
            .store
            .detect_suspicious_sharing(self.config.suspicious.threshold, self.detection_window())?)
    }

    pub fn export_report(&self, owner: &str) -> crate::error::Result<OwnerReport> {
        Ok(self.store.export_report(
            owner,
            self.config.suspicious.threshold,
            self.detection_window(),
        )?)
    }

    pub fn status(&self) -> crate::error::Result<EngineStatus> {
        let mut input_fields: Vec<String> = self.config.input_fields.keys().cloned().collect();
        input_fields.sort();
        let tracked_models = self
            .config
            .tracked_models
            .iter()
            .map(|(model, model_config)| {
                let mut fields: Vec<String> = model_config.fields.keys().cloned().collect();
                fields.sort();
                (model.clone(), fields)
            })
            .collect();
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            storage_path: self.config.storage_path.display().to_string(),
            input_fields,
            tracked_models,
            registry_size: self.registry.len(),
            suspicious_threshold: self.config.suspicious.threshold,
            suspicious_window_hours: self.config.suspicious.window_hours,
            store: self.store.stats()?,
        })
    }

    fn detection_window(&self) -> Duration {
        Duration::hours(self.config.suspicious.window_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::EventKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_engine() -> Arc<ProvenanceEngine> {
        let mut config = EngineConfig::default();
        config.input_fields.insert(
            "email".into(),
            InputFieldConfig {
                category: "contact.email".into(),
                description: "Email address".into(),
                personal: true,
            },
        );
        ProvenanceEngine::with_store(config, AuditStore::open_in_memory().unwrap())
    }

    fn email_rule() -> InputFieldConfig {
        InputFieldConfig {
            category: "contact.email".into(),
            description: "Email address".into(),
            personal: true,
        }
    }

    #[test]
    fn test_register_input_promotes_to_registry() {
        let engine = test_engine();
        let scope = engine.begin_request("POST", "/signup", None, None);
        let tag = engine.register_input(
            &scope,
            "email",
            &email_rule(),
            &json!("alice@example.com"),
            "HTTP POST /signup",
        );
        assert!(engine.registry().contains(&tag.fingerprint));
        assert_eq!(engine.store().stats().unwrap().fingerprint_count, 1);
    }

    #[test]
    fn test_match_payload_prefers_scope_then_registry() {
        let engine = test_engine();
        let scope = engine.begin_request("POST", "/signup", None, None);
        engine.register_input(
            &scope,
            "email",
            &email_rule(),
            &json!("alice@example.com"),
            "HTTP POST /signup",
        );

        // Same request: matched via the scope.
        let matched = engine.match_payload(Some(&scope), &json!({"to": "alice@example.com"}));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].field, "email");

        // Later request with no scope tags: matched via the registry.
        let other = engine.begin_request("POST", "/export", None, None);
        let matched = engine.match_payload(Some(&other), &json!({"to": "alice@example.com"}));
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_match_payload_dedupes_repeated_values() {
        let engine = test_engine();
        let scope = engine.begin_request("POST", "/signup", None, None);
        engine.register_input(
            &scope,
            "email",
            &email_rule(),
            &json!("alice@example.com"),
            "HTTP POST /signup",
        );
        let payload = json!({
            "to": "alice@example.com",
            "reply_to": "alice@example.com",
        });
        let matched = engine.match_payload(Some(&scope), &payload);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_untagged_values_never_match() {
        let engine = test_engine();
        let matched = engine.match_payload(None, &json!({"email": "nobody@example.com"}));
        assert!(matched.is_empty());
    }

    #[test]
    fn test_record_event_persists_matched_fingerprints() {
        let engine = test_engine();
        let tag = DataTag::for_value(
            &json!("alice@example.com"),
            "email",
            "contact.email",
            "Email address",
            Some("alice".into()),
            "test",
            100,
        );
        let event = ProvenanceEvent::new(EventKind::Share, "http.egress", "https://api.partner.com")
            .with_matched_tags(vec![tag.clone()]);
        engine.record_event(&event);
        assert_eq!(engine.store().stats().unwrap().event_count, 1);
        assert!(engine.registry().contains(&tag.fingerprint));
    }

    #[test]
    fn test_request_lifecycle_records_ledger_rows() {
        let engine = test_engine();
        let scope = engine.begin_request("POST", "/signup", Some("127.0.0.1".into()), None);
        scope.set_user_id(Some("alice".into()));
        engine.finish_request(&scope, Some(200), None);
        assert_eq!(engine.store().stats().unwrap().request_count, 1);
    }

    #[test]
    fn test_status_snapshot_lists_names() {
        let engine = test_engine();
        let status = engine.status().unwrap();
        assert_eq!(status.input_fields, vec!["email".to_string()]);
        assert!(status.tracked_models.is_empty());
        assert_eq!(status.registry_size, 0);
        assert_eq!(status.suspicious_threshold, 5);
    }
}
