//! LIFO4 Edge - Main Entry Point
//!
//! Composition root: provisions the device if needed, wires every
//! component, spawns the long-lived tasks, supervises the control loop,
//! and shuts down in order on SIGINT/SIGTERM. Exit code 0 is a graceful
//! shutdown; non-zero means a fault the supervisor should restart from.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lifo4_edge::cache::CacheManager;
use lifo4_edge::config::{EdgeConfig, EdgePaths};
use lifo4_edge::control::{ControlLoop, SharedRx};
use lifo4_edge::engine::DecisionEngine;
use lifo4_edge::fieldbus::{FieldBus, ModbusFieldBus};
use lifo4_edge::healing::{HealingEvent, SelfHealingManager, SupervisorEvent};
use lifo4_edge::metrics::MetricsCollector;
use lifo4_edge::mqtt::{EdgeMqttClient, IngressEvent, Topics};
use lifo4_edge::ota::{self, OtaPolicy, OtaUpdater, SystemReboot};
use lifo4_edge::provisioning::Bootstrap;
use lifo4_edge::safety::SafetyManager;
use lifo4_edge::store::{RetentionPolicy, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("LIFO4 Edge v{}", env!("CARGO_PKG_VERSION"));

    let paths = EdgePaths::default();

    // An unreadable partition marker is a programming invariant breach:
    // exit non-zero so the supervisor restarts into a known state.
    if let Err(e) = ota::active_partition(&paths) {
        tracing::error!("{e}");
        std::process::exit(2);
    }

    // ── Zero-touch provisioning (no-op when already provisioned) ────────
    let mut bootstrap = Bootstrap::new(paths.clone());
    let mut config = bootstrap.run().await?;
    config.apply_env();
    tracing::info!(site_id = %config.site_id, edge_id = %config.edge_id, "configuration loaded");

    // ── Composition ─────────────────────────────────────────────────────
    let store = Arc::new(Store::open(&config.data.db_path)?);
    let cache = Arc::new(CacheManager::new(config.optimization.clone()));
    let metrics = Arc::new(MetricsCollector::new());
    let bus = Arc::new(ModbusFieldBus::new(config.fieldbus.clone()));
    let topics = Topics::new(&config.site_id);

    let (ingress_tx, ingress_rx) = mpsc::channel::<IngressEvent>(64);
    let (ota_tx, ota_rx) = mpsc::channel(4);
    let (loop_tx, healing_rx) = mpsc::channel::<HealingEvent>(32);
    let (supervisor_tx, mut supervisor_rx) = mpsc::channel::<SupervisorEvent>(8);
    let ingress_rx: SharedRx<IngressEvent> = Arc::new(AsyncMutex::new(ingress_rx));
    let healing_rx: SharedRx<HealingEvent> = Arc::new(AsyncMutex::new(healing_rx));

    let link = EdgeMqttClient::connect(
        &config.mqtt,
        &config.edge_id,
        topics.clone(),
        cache.clone(),
        ingress_tx,
        ota_tx,
    );

    let retention = RetentionPolicy {
        telemetry_hours: config.data.telemetry_retention_hours,
        decisions_days: config.data.decisions_retention_days,
        alarms_days: config.data.alarms_retention_days,
        queue_days: config.data.queue_retention_days,
    };
    let healing = Arc::new(SelfHealingManager::new(
        loop_tx,
        supervisor_tx,
        store.clone(),
        cache.clone(),
        retention,
        config.data.max_store_bytes,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Long-lived tasks ────────────────────────────────────────────────
    let ota_task = tokio::spawn(
        OtaUpdater::new(
            paths.clone(),
            OtaPolicy::from_env(),
            link.clone(),
            topics.clone(),
            SystemReboot,
        )
        .run(ota_rx, shutdown_rx.clone()),
    );
    let healing_task = tokio::spawn(
        healing
            .clone()
            .run(bus.clone() as Arc<dyn FieldBus>, shutdown_rx.clone()),
    );

    let spawn_control = |config: &EdgeConfig| {
        let control = ControlLoop::new(
            config.clone(),
            paths.clone(),
            bus.clone(),
            link.clone(),
            store.clone(),
            cache.clone(),
            DecisionEngine::new(config, cache.clone()),
            build_safety(config),
            healing.clone(),
            metrics.clone(),
            ingress_rx.clone(),
            healing_rx.clone(),
        );
        tokio::spawn(control.run(shutdown_rx.clone()))
    };
    let mut control_task = spawn_control(&config);

    // ── Supervision until a shutdown signal ─────────────────────────────
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received");
                break;
            }
            Some(event) = supervisor_rx.recv() => match event {
                SupervisorEvent::RestartControlLoop => {
                    tracing::error!("restarting control loop on watchdog request");
                    control_task.abort();
                    control_task = spawn_control(&config);
                }
            },
        }
    }

    // ── Ordered shutdown: control → sync → subscriptions → store ────────
    let _ = shutdown_tx.send(true);
    let grace = std::time::Duration::from_secs(5);
    let _ = tokio::time::timeout(grace, control_task).await;
    let _ = tokio::time::timeout(grace, healing_task).await;
    ota_task.abort();
    link.shutdown().await;
    drop(store);
    tracing::info!("graceful shutdown complete");
    Ok(())
}

/// Site-specific threshold table when provisioned, compiled defaults
/// otherwise.
fn build_safety(config: &EdgeConfig) -> SafetyManager {
    if config.safety_limits.is_empty() {
        SafetyManager::with_defaults()
    } else {
        SafetyManager::new(config.safety_limits.clone())
    }
}
