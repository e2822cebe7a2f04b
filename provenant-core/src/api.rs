//! Audit query API.
//!
//! A small read-only HTTP surface over the audit store: event listings,
//! known fingerprints, the suspicious-sharing report, per-owner exports,
//! and an engine status snapshot. Intended to be served on an internal
//! port, separate from the application's own router.
//!
//! When `audit_token` is configured, every route except `/health` requires
//! it, via the `x-audit-token` header or an `audit_token` query parameter.

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::engine::ProvenanceEngine;
use crate::error::ProvenantError;
use crate::store::EventFilter;
use crate::tag::EventKind;

/// Build the audit router. The engine is shared with the interception
/// layers; this surface only reads.
pub fn audit_router(engine: Arc<ProvenanceEngine>) -> Router {
    let protected = Router::new()
        .route("/events", get(list_events))
        .route("/fingerprints", get(list_fingerprints))
        .route("/suspicious", get(list_suspicious))
        .route("/report/{owner}", get(owner_report))
        .route("/status", get(engine_status))
        .layer(middleware::from_fn_with_state(
            engine.clone(),
            require_token,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unauthorized,
    Internal(ProvenantError),
}

impl From<ProvenantError> for ApiError {
    fn from(e: ProvenantError) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid audit token".into()),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "audit query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn require_token(
    State(engine): State<Arc<ProvenanceEngine>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = engine.config().audit_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let header_token = request
        .headers()
        .get("x-audit-token")
        .and_then(|v| v.to_str().ok());
    let query_token = request.uri().query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "audit_token")
            .map(|(_, v)| v.into_owned())
    });

    let presented = header_token.map(str::to_string).or(query_token);
    if presented.as_deref() == Some(expected) {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::Unauthorized)
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    event_type: Option<String>,
    owner: Option<String>,
    destination: Option<String>,
}

async fn list_events(
    State(engine): State<Arc<ProvenanceEngine>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind = match &query.event_type {
        Some(raw) => Some(
            EventKind::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown event type '{raw}'")))?,
        ),
        None => None,
    };
    let events = engine.fetch_events(&EventFilter {
        kind,
        owner: query.owner,
        destination: query.destination,
        limit: Some(query.limit.unwrap_or(100)),
        offset: query.offset,
    })?;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

async fn list_fingerprints(
    State(engine): State<Arc<ProvenanceEngine>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let fingerprints = engine.fetch_fingerprints()?;
    Ok(Json(
        json!({ "count": fingerprints.len(), "fingerprints": fingerprints }),
    ))
}

async fn list_suspicious(
    State(engine): State<Arc<ProvenanceEngine>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let patterns = engine.detect_suspicious()?;
    let summary = engine.summarize()?;
    Ok(Json(json!({
        "count": patterns.len(),
        "patterns": patterns,
        "summary": summary,
    })))
}

async fn owner_report(
    State(engine): State<Arc<ProvenanceEngine>>,
    Path(owner): Path<String>,
) -> Result<Json<crate::store::OwnerReport>, ApiError> {
    Ok(Json(engine.export_report(&owner)?))
}

async fn engine_status(
    State(engine): State<Arc<ProvenanceEngine>>,
) -> Result<Json<crate::engine::EngineStatus>, ApiError> {
    Ok(Json(engine.status()?))
}
