//! Request-scoped provenance context.
//!
//! One `RequestContext` exists per inbound request or operation; it owns the
//! fingerprint -> tag map for that request's lifetime and is never shared
//! between concurrent requests, so it needs no locking of its own. The
//! `RequestScope` handle exists only to carry the context across an async
//! call chain; its mutex is uncontended by construction.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::tag::DataTag;

/// Per-request provenance state.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub user_id: Option<String>,
    pub method: String,
    pub path: String,
    pub client_ip: Option<String>,
    pub started_at: DateTime<Utc>,
    tags_by_fingerprint: HashMap<String, DataTag>,
    /// Insertion order, so field-name matching sees tags in arrival order.
    order: Vec<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id: None,
            method: method.into(),
            path: path.into(),
            client_ip: None,
            started_at: Utc::now(),
            tags_by_fingerprint: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_client_ip(mut self, client_ip: Option<String>) -> Self {
        self.client_ip = client_ip;
        self
    }

    /// Register a tag for `value` in this request's local map. The engine is
    /// responsible for also promoting the tag into the global registry.
    pub fn register(
        &mut self,
        field: &str,
        category: &str,
        description: &str,
        value: &Value,
        owner: Option<String>,
        source: &str,
        preview_max_len: usize,
    ) -> DataTag {
        let tag = DataTag::for_value(
            value,
            field,
            category,
            description,
            owner,
            source,
            preview_max_len,
        );
        if !self.tags_by_fingerprint.contains_key(&tag.fingerprint) {
            self.order.push(tag.fingerprint.clone());
        }
        self.tags_by_fingerprint
            .insert(tag.fingerprint.clone(), tag.clone());
        tag
    }

    /// Tags matching any of `fingerprints`, in the given order.
    pub fn find(&self, fingerprints: &[String]) -> Vec<DataTag> {
        fingerprints
            .iter()
            .filter_map(|f| self.tags_by_fingerprint.get(f))
            .cloned()
            .collect()
    }

    /// Tags registered under a given field name, in registration order.
    pub fn find_by_field(&self, field: &str) -> Vec<DataTag> {
        self.order
            .iter()
            .filter_map(|f| self.tags_by_fingerprint.get(f))
            .filter(|t| t.field == field)
            .cloned()
            .collect()
    }

    pub fn tag_count(&self) -> usize {
        self.tags_by_fingerprint.len()
    }

    /// All tags in registration order.
    pub fn tags(&self) -> Vec<DataTag> {
        self.order
            .iter()
            .filter_map(|f| self.tags_by_fingerprint.get(f))
            .cloned()
            .collect()
    }
}

/// Cloneable handle threading a [`RequestContext`] through the async call
/// chain (middleware, handlers, storage hooks, egress client).
#[derive(Debug, Clone)]
pub struct RequestScope {
    inner: Arc<Mutex<RequestContext>>,
}

impl RequestScope {
    pub fn new(context: RequestContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.lock().request_id
    }

    pub fn user_id(&self) -> Option<String> {
        self.lock().user_id.clone()
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        self.lock().user_id = user_id;
    }

    pub fn register(
        &self,
        field: &str,
        category: &str,
        description: &str,
        value: &Value,
        owner: Option<String>,
        source: &str,
        preview_max_len: usize,
    ) -> DataTag {
        self.lock()
            .register(field, category, description, value, owner, source, preview_max_len)
    }

    pub fn find(&self, fingerprints: &[String]) -> Vec<DataTag> {
        self.lock().find(fingerprints)
    }

    pub fn find_by_field(&self, field: &str) -> Vec<DataTag> {
        self.lock().find_by_field(field)
    }

    pub fn tag_count(&self) -> usize {
        self.lock().tag_count()
    }

    pub fn tags(&self) -> Vec<DataTag> {
        self.lock().tags()
    }

    pub fn method(&self) -> String {
        self.lock().method.clone()
    }

    pub fn path(&self) -> String {
        self.lock().path.clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.lock().started_at
    }

    pub fn client_ip(&self) -> Option<String> {
        self.lock().client_ip.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestContext> {
        // The scope is owned by a single request task; poisoning can only
        // happen if that task panicked mid-register, in which case the
        // context contents are still sound.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
