//! Egress interception.
//!
//! A wrapped HTTP client the application uses for its outbound calls. Every
//! send captures the request's observable surfaces (query, form, JSON body,
//! custom `x-*` headers), matches them against known tags, and records one
//! SHARE event per call. The application's own error handling is
//! unaffected: the inner client's result is returned untouched, and SHARE
//! events are recorded for failed sends too, with the error noted.
//!
//! Secret-bearing headers are never captured; see
//! [`crate::payload::capturable_headers`].

use reqwest::Method;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use url::Url;

use crate::context::RequestScope;
use crate::engine::ProvenanceEngine;
use crate::payload::{capturable_headers, flatten_value};
use crate::tag::{EventKind, ProvenanceEvent};

/// An outbound HTTP request described declaratively, so its taggable
/// surfaces can be captured before it is handed to the inner client.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub json: Option<Value>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            query: Vec::new(),
            form: Vec::new(),
            json: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn with_form(mut self, form: Vec<(String, String)>) -> Self {
        self.form = form;
        self
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// HTTP client wrapper that records SHARE events for each outbound call.
#[derive(Debug, Clone)]
pub struct EgressClient {
    engine: Arc<ProvenanceEngine>,
    inner: reqwest::Client,
}

impl EgressClient {
    pub fn new(engine: Arc<ProvenanceEngine>) -> Self {
        Self {
            engine,
            inner: reqwest::Client::new(),
        }
    }

    /// Wrap an existing client, keeping the application's own timeouts and
    /// TLS settings.
    pub fn with_client(engine: Arc<ProvenanceEngine>, inner: reqwest::Client) -> Self {
        Self { engine, inner }
    }

    /// Send `request`, recording the share. Pass the current request scope
    /// when there is one; background jobs pass `None` and still match
    /// against the global registry.
    pub async fn send(
        &self,
        scope: Option<&RequestScope>,
        request: OutboundRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let ignored = request
            .url
            .host_str()
            .is_some_and(|host| self.engine.config().is_ignored_host(host));

        let capture = if ignored {
            Value::Null
        } else {
            capture_surfaces(&request)
        };

        let mut builder = self.inner.request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        } else if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }

        let result = builder.send().await;

        if !ignored {
            let outcome = match &result {
                Ok(response) => json!({ "status": response.status().as_u16() }),
                Err(e) => json!({ "error": e.to_string() }),
            };
            self.record_share(scope, &request, &capture, outcome);
        }
        result
    }

    /// Convenience for the common JSON POST.
    pub async fn post_json(
        &self,
        scope: Option<&RequestScope>,
        url: Url,
        body: Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.send(scope, OutboundRequest::post(url).with_json(body))
            .await
    }

    fn record_share(
        &self,
        scope: Option<&RequestScope>,
        request: &OutboundRequest,
        capture: &Value,
        outcome: Value,
    ) {
        let matched = self.engine.match_payload(scope, capture);
        if matched.is_empty() && !self.engine.config().record_unmatched_shares {
            return;
        }

        let destination = request.url.origin().ascii_serialization();
        let captured_fields: Vec<String> = flatten_value(capture)
            .into_iter()
            .map(|(path, _)| path)
            .collect();

        let event = ProvenanceEvent::new(EventKind::Share, "http.egress", destination)
            .with_payload(json!({
                "method": request.method.as_str(),
                "path": request.url.path(),
                "captured_fields": captured_fields,
            }))
            .with_request(
                scope.map(RequestScope::request_id),
                scope.and_then(RequestScope::user_id),
            )
            .with_matched_tags(matched)
            .with_extras(outcome);
        self.engine.record_event(&event);
    }
}

/// Collapse a request's observable surfaces into one JSON value for
/// flattening and matching. Duplicate keys within a surface collapse to the
/// last occurrence, which is fine for matching purposes.
fn capture_surfaces(request: &OutboundRequest) -> Value {
    let mut surfaces = Map::new();
    if !request.query.is_empty() {
        surfaces.insert("query".into(), pairs_to_object(&request.query));
    }
    if !request.form.is_empty() {
        surfaces.insert("form".into(), pairs_to_object(&request.form));
    }
    if let Some(body) = &request.json {
        surfaces.insert("json".into(), body.clone());
    }
    let headers = capturable_headers(&request.headers);
    if !headers.is_empty() {
        surfaces.insert("headers".into(), pairs_to_object(&headers));
    }
    Value::Object(surfaces)
}

fn pairs_to_object(pairs: &[(String, String)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}
