//! Ramp - Gradual Rollout Daemon
//!
//! The daemon owns feature rollout state, evaluates new-variant health on a
//! fixed tick, and serves the admin HTTP API for operators, dashboards, and
//! out-of-process sample producers.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use ramp_common::config::{RampConfig, load_config};
use ramp_common::{Feature, FeatureId, RolloutState, fresh_seed};
use rampd::audit::AuditTrail;
use rampd::controller::RolloutController;
use rampd::evaluator::HealthEvaluator;
use rampd::events::EventBus;
use rampd::http_api::{self, HttpState};
use rampd::metrics;
use rampd::notify::{EventBusSink, SinkSet, TracingSink};
use rampd::registry::FeatureRegistry;
use rampd::router::VariantRouter;
use rampd::sampler::{self, MetricSampler, SampleWindows};
use rampd::store::StateStore;

#[derive(Parser)]
#[command(name = "rampd")]
#[command(author, version, about = "Ramp daemon - gradual rollout orchestration")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Admin API port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the rollout state snapshot (overrides the config file)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Path to the feature registry snapshot (overrides the config file)
    #[arg(long)]
    features_file: Option<PathBuf>,

    /// Path to the audit trail file (overrides the config file)
    #[arg(long)]
    audit_file: Option<PathBuf>,

    /// Evaluation tick interval, e.g. "30s" or "2m" (overrides the config
    /// file)
    #[arg(long, value_parser = humantime::parse_duration)]
    tick_interval: Option<std::time::Duration>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so the configured level applies.
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RampConfig::default(),
    };
    if let Some(interval) = cli.tick_interval {
        config.controller.tick_interval_secs = interval.as_secs().max(1);
    }

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(config.general.log_level.clone())
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting Ramp daemon...");
    metrics::register_metrics();

    // State store, with snapshot recovery from a previous run.
    let state_path = cli
        .state_file
        .clone()
        .or_else(|| config.general.state_file.as_ref().map(PathBuf::from));
    let store = Arc::new(match &state_path {
        Some(path) if path.exists() => match StateStore::load_from_file(path) {
            Ok(store) => {
                info!("Loaded rollout state from {:?}", path);
                store
            }
            Err(e) => {
                warn!("Failed to load state from {:?}: {}", path, e);
                StateStore::new().with_persistence(path.clone())
            }
        },
        Some(path) => {
            info!("Creating new state snapshot at {:?}", path);
            StateStore::new().with_persistence(path.clone())
        }
        None => {
            info!("Rollout state in-memory only (no persistence)");
            StateStore::new()
        }
    });

    // Audit trail, replaying existing records.
    let audit_path = cli
        .audit_file
        .clone()
        .or_else(|| config.general.audit_file.as_ref().map(PathBuf::from));
    let audit = Arc::new(match audit_path {
        Some(path) => {
            let (trail, _writer) = AuditTrail::with_persistence(path.clone())?;
            info!("Audit trail at {:?} ({} entries)", path, trail.len());
            trail
        }
        None => {
            info!("Audit trail in-memory only (no persistence)");
            AuditTrail::new()
        }
    });

    // Feature registry, re-hydrated from its own snapshot so features
    // registered through the API survive a restart.
    let features_path = cli
        .features_file
        .clone()
        .or_else(|| config.general.features_file.as_ref().map(PathBuf::from));
    let registry = Arc::new(match &features_path {
        Some(path) if path.exists() => match FeatureRegistry::load_from_file(path) {
            Ok(registry) => {
                info!("Loaded {} registered features from {:?}", registry.len(), path);
                registry
            }
            Err(e) => {
                warn!("Failed to load registry from {:?}: {}", path, e);
                FeatureRegistry::new().with_persistence(path.clone())
            }
        },
        Some(path) => {
            info!("Creating new registry snapshot at {:?}", path);
            FeatureRegistry::new().with_persistence(path.clone())
        }
        None => {
            info!("Feature registry in-memory only (no persistence)");
            FeatureRegistry::new()
        }
    });

    // Register configured features; snapshots keep their existing entries
    // and rollout states.
    for seed in &config.features {
        let id = FeatureId::new(&seed.id);
        if registry.get(&id).is_none() {
            info!("Registering feature: {}", seed.id);
            registry.register(
                Feature::new(seed.id.clone(), seed.description.clone()),
                seed.thresholds,
            )?;
        }
        if store.get(&id).is_none() {
            store.insert_initial(RolloutState::initial(id, fresh_seed()))?;
        }
    }

    // Sample ingestion pipeline.
    let windows = Arc::new(SampleWindows::new(
        config.controller.sample_window(),
        config.controller.max_window_samples,
    ));
    let (metric_sampler, sample_rx) = MetricSampler::new(sampler::DEFAULT_CHANNEL_CAPACITY);
    sampler::start_drain_task(sample_rx, Arc::clone(&windows));

    let evaluator = Arc::new(HealthEvaluator::new(
        Arc::clone(&windows),
        Arc::clone(&registry),
    ));

    // Notification fan-out: structured logs plus the dashboard event bus.
    let event_bus = EventBus::new();
    let sinks = SinkSet::new(vec![
        Arc::new(TracingSink),
        Arc::new(EventBusSink::new(event_bus.clone())),
    ]);

    let controller = Arc::new(RolloutController::new(
        config.controller.clone(),
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&evaluator),
        Arc::clone(&audit),
        sinks,
    ));
    Arc::clone(&controller).start_tick_task();

    // Router snapshot: populated once so routing works before the first
    // periodic refresh.
    let variant_router = Arc::new(VariantRouter::new());
    variant_router.refresh(&store, &registry);
    Arc::clone(&variant_router).start_refresh_task(
        Arc::clone(&store),
        Arc::clone(&registry),
        config.controller.router_refresh_interval(),
    );

    let port = cli.port.unwrap_or(config.general.http_port);
    let server = http_api::start_server(
        port,
        HttpState {
            registry,
            store,
            controller,
            audit,
            evaluator,
            variant_router,
            sampler: metric_sampler,
            version: env!("CARGO_PKG_VERSION"),
            started_at: Instant::now(),
        },
    )
    .await;

    server.await??;
    Ok(())
}
