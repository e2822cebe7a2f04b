//! Ingress interception.
//!
//! A tower middleware that runs in front of the application's own routes.
//! It buffers the request body, tags configured input fields across the
//! query string, form body, JSON body, and cookies, records one INGRESS
//! event per tagged field, and threads the request scope through the
//! request's extensions so downstream handlers, storage hooks, and the
//! egress client can reach it.
//!
//! The middleware is fail-open end to end: a malformed body or a store
//! hiccup is logged and the application request proceeds untouched.

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::InputFieldConfig;
use crate::context::RequestScope;
use crate::engine::ProvenanceEngine;
use crate::payload::{flatten_value, is_non_empty, leaf_segment, preview_value};
use crate::tag::{EventKind, ProvenanceEvent};

/// Bodies larger than this are not inspected. The request still goes
/// through; only tagging is skipped.
const MAX_INSPECTED_BODY: usize = 2 * 1024 * 1024;

/// Resolves the authenticated user for a request, so tags and events carry
/// an owner. The default reads a plain header; applications with real
/// session handling implement this against their own auth layer.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<String>;
}

/// Default resolver: reads the user identifier from a request header
/// (`x-user-id` unless overridden).
pub struct HeaderIdentityResolver {
    header: String,
}

impl HeaderIdentityResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for HeaderIdentityResolver {
    fn default() -> Self {
        Self::new("x-user-id")
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Shared state for the ingress middleware.
#[derive(Clone)]
pub struct IngressState {
    pub engine: Arc<ProvenanceEngine>,
    pub resolver: Arc<dyn IdentityResolver>,
}

impl IngressState {
    pub fn new(engine: Arc<ProvenanceEngine>) -> Self {
        Self {
            engine,
            resolver: Arc::new(HeaderIdentityResolver::default()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// The decoded inbound surfaces a request exposes for tagging.
#[derive(Debug, Default)]
pub struct IngressRequest {
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub json: Option<Value>,
    pub cookies: Vec<(String, String)>,
}

/// Finalizes the request ledger row exactly once. Runs on drop, so the row
/// is closed out with an error marker even when the handler panics or the
/// request future is cancelled mid-flight.
struct FinalizeGuard {
    engine: Arc<ProvenanceEngine>,
    scope: RequestScope,
    status: Option<u16>,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        match self.status {
            Some(status) => self.engine.finish_request(&self.scope, Some(status), None),
            None => self.engine.finish_request(
                &self.scope,
                None,
                Some("request aborted before a response was produced"),
            ),
        }
    }
}

/// Axum middleware entry point. Install with
/// `axum::middleware::from_fn_with_state(state, track_ingress)` on the
/// application router.
pub async fn track_ingress(
    State(state): State<IngressState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let client_ip = client_ip_of(&request);
    let user_id = state.resolver.resolve(request.headers());

    let scope = state
        .engine
        .begin_request(&method, &path, client_ip, user_id);
    let mut guard = FinalizeGuard {
        engine: state.engine.clone(),
        scope: scope.clone(),
        status: None,
    };

    let (request, inbound) = decode_request(request).await;
    collect_ingress(&state.engine, &scope, &inbound);

    let mut request = request;
    request.extensions_mut().insert(scope);

    let response = next.run(request).await;
    guard.status = Some(response.status().as_u16());
    response
}

fn client_ip_of(request: &Request) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

/// Buffer and decode the request's taggable surfaces, then rebuild the
/// request so the application sees the body unchanged.
async fn decode_request(request: Request) -> (Request, IngressRequest) {
    let mut inbound = IngressRequest {
        query: decode_query(request.uri().query()),
        cookies: decode_cookies(request.headers()),
        ..Default::default()
    };

    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_INSPECTED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "request body not inspectable, skipping ingress tagging");
            Bytes::new()
        }
    };

    if !bytes.is_empty() {
        if content_type.starts_with("application/json") {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => inbound.json = Some(value),
                Err(e) => tracing::debug!(error = %e, "request body is not valid JSON"),
            }
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            inbound.form = url::form_urlencoded::parse(&bytes)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
        }
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    (request, inbound)
}

fn decode_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

/// Cookie values are percent-decoded so a value arriving in a cookie
/// fingerprints identically to the same value in a form or JSON body.
fn decode_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(';')
                .map(str::trim)
                .filter(|pair| pair.contains('='))
                .filter_map(|pair| url::form_urlencoded::parse(pair.as_bytes()).next())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

/// Tag every configured input field present in the request and record one
/// INGRESS event per tagged field.
pub fn collect_ingress(engine: &ProvenanceEngine, scope: &RequestScope, inbound: &IngressRequest) {
    let source = format!("HTTP {} {}", scope.method(), scope.path());

    for (name, value) in &inbound.query {
        tag_field(engine, scope, name, &json!(value), "query", &source);
    }
    for (name, value) in &inbound.form {
        tag_field(engine, scope, name, &json!(value), "form", &source);
    }
    for (name, value) in &inbound.cookies {
        tag_field(engine, scope, name, &json!(value), "cookie", &source);
    }
    if let Some(body) = &inbound.json {
        for (path, leaf) in flatten_value(body) {
            tag_field(engine, scope, &path, &leaf, "json", &source);
        }
    }
}

/// Look up the tagging rule for a field: the full dotted path first, then
/// its final segment, so `user.email` falls back to an `email` rule.
fn rule_for<'a>(engine: &'a ProvenanceEngine, path: &str) -> Option<&'a InputFieldConfig> {
    let fields = &engine.config().input_fields;
    fields.get(path).or_else(|| fields.get(leaf_segment(path)))
}

fn tag_field(
    engine: &ProvenanceEngine,
    scope: &RequestScope,
    path: &str,
    value: &Value,
    section: &str,
    source: &str,
) {
    if !is_non_empty(value) {
        return;
    }
    let Some(rule) = rule_for(engine, path) else {
        return;
    };
    let tag = engine.register_input(scope, path, rule, value, source);
    let event = ProvenanceEvent::new(EventKind::Ingress, "http.ingress", source)
        .with_payload(json!({
            "field": path,
            "section": section,
            "category": tag.category,
            "preview": preview_value(value, engine.config().preview_max_len),
        }))
        .with_request(Some(scope.request_id()), scope.user_id())
        .with_matched_tags(vec![tag]);
    engine.record_event(&event);
}
