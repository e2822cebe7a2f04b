//! Provenant CLI — query the audit trail and serve the audit API.

use anyhow::Context;
use clap::Parser;
use provenant_core::{
    audit_router, EngineConfig, EventFilter, EventKind, ProvenanceEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Provenant: runtime data-provenance auditing
#[derive(Parser, Debug)]
#[command(name = "provenant", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List recorded provenance events, newest first
    Events {
        /// Filter by event type: ingress, storage, share
        #[arg(short = 't', long)]
        event_type: Option<String>,

        /// Filter by owner identifier
        #[arg(short, long)]
        owner: Option<String>,

        /// Filter by destination substring
        #[arg(short, long)]
        destination: Option<String>,

        /// Maximum number of events
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Skip this many events (for paging)
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// List known fingerprints and their tag metadata
    Fingerprints,
    /// Run the suspicious-sharing detector over the configured window
    Suspicious,
    /// Export the full audit report for one data owner (JSON)
    Report {
        /// Owner identifier (as carried on tags and events)
        owner: String,
    },
    /// Show engine and store status
    Status,
    /// Serve the audit query API
    Serve {
        /// Bind address
        #[arg(short, long, default_value = "127.0.0.1:7431")]
        bind: String,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("provenant={level},provenant_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let engine = ProvenanceEngine::new(config).context("failed to start provenance engine")?;

    match cli.command {
        Commands::Events {
            event_type,
            owner,
            destination,
            limit,
            offset,
        } => list_events(&engine, event_type, owner, destination, limit, offset),
        Commands::Fingerprints => list_fingerprints(&engine),
        Commands::Suspicious => list_suspicious(&engine),
        Commands::Report { owner } => export_report(&engine, &owner),
        Commands::Status => show_status(&engine),
        Commands::Serve { bind } => serve(engine, &bind).await,
    }
}

fn list_events(
    engine: &ProvenanceEngine,
    event_type: Option<String>,
    owner: Option<String>,
    destination: Option<String>,
    limit: usize,
    offset: usize,
) -> anyhow::Result<()> {
    let kind = match event_type.as_deref() {
        Some(raw) => Some(
            EventKind::parse(raw)
                .with_context(|| format!("unknown event type '{raw}' (expected ingress, storage, or share)"))?,
        ),
        None => None,
    };
    let events = engine.fetch_events(&EventFilter {
        kind,
        owner,
        destination,
        limit: Some(limit),
        offset: Some(offset),
    })?;

    if events.is_empty() {
        println!("No events recorded.");
        return Ok(());
    }
    for event in &events {
        let owners = event.owner_identifiers().join(", ");
        println!(
            "{}  {:<7}  {}  [{} tag(s)]  {}",
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event.kind,
            event.target,
            event.matched_tags.len(),
            owners,
        );
    }
    Ok(())
}

fn list_fingerprints(engine: &ProvenanceEngine) -> anyhow::Result<()> {
    let records = engine.fetch_fingerprints()?;
    if records.is_empty() {
        println!("No fingerprints registered.");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {:<24}  {:<20}  owner={}",
            record.fingerprint,
            record.field,
            record.category,
            record.owner.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn list_suspicious(engine: &ProvenanceEngine) -> anyhow::Result<()> {
    let patterns = engine.detect_suspicious()?;
    if patterns.is_empty() {
        println!("No suspicious sharing patterns detected.");
        return Ok(());
    }
    for pattern in &patterns {
        println!(
            "{} events to {} involving [{}] between {} and {}",
            pattern.count,
            pattern.destination,
            pattern.owners.join(", "),
            pattern.first_seen.format("%Y-%m-%d %H:%M:%S"),
            pattern.last_seen.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn export_report(engine: &ProvenanceEngine, owner: &str) -> anyhow::Result<()> {
    let report = engine.export_report(owner)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn show_status(engine: &ProvenanceEngine) -> anyhow::Result<()> {
    let status = engine.status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn serve(engine: Arc<ProvenanceEngine>, bind: &str) -> anyhow::Result<()> {
    let router = audit_router(engine);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(address = %listener.local_addr()?, "audit API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
