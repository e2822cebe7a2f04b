//! # Provenant Core
//!
//! Core library for the Provenant runtime data-provenance engine.
//! Tags personal data as it enters a service, follows it by content
//! fingerprint through the persistence layer and outbound HTTP calls, and
//! keeps a durable audit trail that surfaces undisclosed sharing patterns.
//!
//! Interception is explicit: install the ingress middleware on your router,
//! call the storage hook before commits, and send outbound requests through
//! the egress client. Everything downstream of a validated configuration is
//! fail-open; the audited application never breaks because of the audit
//! trail.

pub mod api;
pub mod config;
pub mod context;
pub mod egress;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod ingress;
pub mod payload;
pub mod registry;
pub mod storage;
pub mod store;
pub mod tag;

// Re-export commonly used types at the crate root.
pub use api::audit_router;
pub use config::{EngineConfig, FieldConfig, InputFieldConfig, ModelConfig, SuspiciousConfig};
pub use context::{RequestContext, RequestScope};
pub use egress::{EgressClient, OutboundRequest};
pub use engine::{EngineStatus, ProvenanceEngine};
pub use error::{ConfigError, ProvenantError, Result, StoreError};
pub use ingress::{HeaderIdentityResolver, IdentityResolver, IngressState, track_ingress};
pub use registry::GlobalRegistry;
pub use storage::{StorageInterceptor, WriteOperation};
pub use store::{
    AuditStore, EventFilter, FingerprintRecord, OwnerReport, RequestRecord, SharingPattern,
    SharingSummary,
};
pub use tag::{DataTag, EventKind, ProvenanceEvent};
