//! End-to-end flow tests: a signup request tagged at ingress, matched at a
//! persistence write, and detected again when the same data leaves through
//! the egress client toward a partner service.

use axum::extract::{Extension, Json, State};
use axum::http::{Request, StatusCode};
use axum::middleware;
use axum::routing::post;
use axum::Router;
use provenant_core::{
    AuditStore, EgressClient, EngineConfig, EventFilter, EventKind, FieldConfig, IngressState,
    InputFieldConfig, ModelConfig, OutboundRequest, ProvenanceEngine, RequestScope,
    StorageInterceptor, WriteOperation, track_ingress,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

fn engine_with_signup_config() -> Arc<ProvenanceEngine> {
    let mut config = EngineConfig::default();
    config.input_fields.insert(
        "email".into(),
        InputFieldConfig {
            category: "contact.email".into(),
            description: "Email address".into(),
            personal: true,
        },
    );
    config.input_fields.insert(
        "income".into(),
        InputFieldConfig {
            category: "financial.income".into(),
            description: "Declared income".into(),
            personal: true,
        },
    );
    let mut fields = HashMap::new();
    fields.insert(
        "email".to_string(),
        FieldConfig {
            category: "contact.email".into(),
            description: "User email".into(),
            personal: true,
            owner_attribute: Some("email".into()),
        },
    );
    config
        .tracked_models
        .insert("User".into(), ModelConfig { fields });
    ProvenanceEngine::with_store(config, AuditStore::open_in_memory().unwrap())
}

/// Minimal partner endpoint on an ephemeral local port.
async fn spawn_partner() -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().route(
        "/v1/users",
        post(|| async { Json(json!({"accepted": true})) }),
    );
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/v1/users")).unwrap()
}

#[derive(Clone)]
struct AppState {
    interceptor: StorageInterceptor,
    egress: EgressClient,
    partner_url: Url,
}

/// The application under audit: persists the new user, then forwards their
/// email to a partner API.
async fn signup(
    State(state): State<AppState>,
    Extension(scope): Extension<RequestScope>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.interceptor.observe_write(
        Some(&scope),
        "User",
        WriteOperation::Insert,
        Some("1"),
        &body,
    );
    let share = OutboundRequest::post(state.partner_url.clone())
        .with_json(json!({ "contact": body["email"] }));
    match state.egress.send(Some(&scope), share).await {
        Ok(_) => StatusCode::CREATED,
        Err(_) => StatusCode::BAD_GATEWAY,
    }
}

fn events_of(engine: &ProvenanceEngine, kind: EventKind) -> Vec<provenant_core::ProvenanceEvent> {
    engine
        .fetch_events(&EventFilter {
            kind: Some(kind),
            ..Default::default()
        })
        .unwrap()
}

#[tokio::test]
async fn test_signup_flow_records_full_provenance_chain() {
    let engine = engine_with_signup_config();
    let partner_url = spawn_partner().await;
    let partner_origin = partner_url.origin().ascii_serialization();

    let state = AppState {
        interceptor: StorageInterceptor::new(engine.clone()),
        egress: EgressClient::new(engine.clone()),
        partner_url,
    };
    let app = Router::new()
        .route("/signup", post(signup))
        .with_state(state)
        .layer(middleware::from_fn_with_state(
            IngressState::new(engine.clone()),
            track_ingress,
        ));

    let body = json!({"email": "alice@example.com", "income": 52000});
    let request = Request::post("/signup")
        .header("content-type", "application/json")
        .header("x-user-id", "alice")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let response = tower::ServiceExt::oneshot(app, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Two tagged fields entered the system.
    let ingress = events_of(&engine, EventKind::Ingress);
    assert_eq!(ingress.len(), 2);
    let categories: Vec<&str> = ingress
        .iter()
        .flat_map(|e| e.matched_tags.iter().map(|t| t.category.as_str()))
        .collect();
    assert!(categories.contains(&"contact.email"));
    assert!(categories.contains(&"financial.income"));

    // The persistence write matched the tagged email.
    let storage = events_of(&engine, EventKind::Storage);
    assert_eq!(storage.len(), 1);
    assert_eq!(storage[0].target, "insert User");
    assert!(storage[0]
        .matched_tags
        .iter()
        .any(|t| t.category == "contact.email"));

    // The partner call was recorded with the matched email tag and the
    // destination reduced to an origin.
    let shares = events_of(&engine, EventKind::Share);
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].target, partner_origin);
    assert_eq!(shares[0].matched_tags.len(), 1);
    assert_eq!(shares[0].matched_tags[0].category, "contact.email");
    assert_eq!(shares[0].user_id.as_deref(), Some("alice"));

    // The request itself landed in the ledger.
    assert_eq!(engine.store().stats().unwrap().request_count, 1);
}

#[tokio::test]
async fn test_repeated_sharing_surfaces_suspicious_pattern() {
    let engine = engine_with_signup_config();
    let partner_url = spawn_partner().await;
    let egress = EgressClient::new(engine.clone());

    // Tag the email in one request, then share it repeatedly from
    // background work with no request scope.
    let scope = engine.begin_request("POST", "/signup", None, Some("alice".into()));
    engine.register_input(
        &scope,
        "email",
        &engine.config().input_fields["email"].clone(),
        &json!("alice@example.com"),
        "HTTP POST /signup",
    );
    engine.finish_request(&scope, Some(201), None);

    for _ in 0..6 {
        let request = OutboundRequest::post(partner_url.clone())
            .with_json(json!({"contact": "alice@example.com"}));
        egress.send(None, request).await.unwrap();
    }

    let patterns = engine.detect_suspicious().unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].count, 6);
    assert_eq!(patterns[0].destination, partner_url.origin().ascii_serialization());
    assert_eq!(patterns[0].owners, vec!["alice"]);
}

#[tokio::test]
async fn test_untagged_data_never_matches() {
    let engine = engine_with_signup_config();
    let partner_url = spawn_partner().await;
    let egress = EgressClient::new(engine.clone());

    let request = OutboundRequest::post(partner_url)
        .with_json(json!({"contact": "stranger@example.com"}));
    egress.send(None, request).await.unwrap();

    let shares = events_of(&engine, EventKind::Share);
    assert_eq!(shares.len(), 1);
    assert!(shares[0].matched_tags.is_empty());
}

#[tokio::test]
async fn test_ignored_host_is_not_recorded() {
    let engine = {
        let mut config = EngineConfig::default();
        config.ignored_hosts.insert("127.0.0.1".into());
        ProvenanceEngine::with_store(config, AuditStore::open_in_memory().unwrap())
    };
    let partner_url = spawn_partner().await;
    let egress = EgressClient::new(engine.clone());

    let request = OutboundRequest::post(partner_url).with_json(json!({"x": 1}));
    egress.send(None, request).await.unwrap();

    assert!(events_of(&engine, EventKind::Share).is_empty());
}

#[tokio::test]
async fn test_panicking_handler_still_finalizes_ledger_row() {
    let engine = engine_with_signup_config();
    let app = Router::new()
        .route(
            "/boom",
            post(|| async {
                panic!("handler blew up");
                #[allow(unreachable_code)]
                ()
            }),
        )
        .layer(middleware::from_fn_with_state(
            IngressState::new(engine.clone()),
            track_ingress,
        ));

    let request = Request::post("/boom")
        .body(axum::body::Body::empty())
        .unwrap();
    let result = tokio::spawn(async move { tower::ServiceExt::oneshot(app, request).await }).await;
    assert!(result.is_err());

    let rows = engine.store().fetch_requests(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path, "/boom");
    assert!(rows[0].ended_at.is_some());
    assert!(rows[0].error.is_some());
    assert_eq!(rows[0].status_code, None);
}

#[tokio::test]
async fn test_owner_report_covers_the_whole_chain() {
    let engine = engine_with_signup_config();
    let partner_url = spawn_partner().await;
    let egress = EgressClient::new(engine.clone());

    let scope = engine.begin_request("POST", "/signup", None, Some("alice".into()));
    engine.register_input(
        &scope,
        "email",
        &engine.config().input_fields["email"].clone(),
        &json!("alice@example.com"),
        "HTTP POST /signup",
    );
    let request = OutboundRequest::post(partner_url.clone())
        .with_json(json!({"contact": "alice@example.com"}));
    egress.send(Some(&scope), request).await.unwrap();
    engine.finish_request(&scope, Some(201), None);

    let report = engine.export_report("alice").unwrap();
    assert_eq!(report.owner, "alice");
    assert_eq!(report.tags.len(), 1);
    assert_eq!(report.events.len(), 1);
    assert_eq!(
        report.summary.by_destination[&partner_url.origin().ascii_serialization()],
        1
    );
}
