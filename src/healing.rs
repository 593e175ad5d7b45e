//! Self-Healing Manager
//!
//! Watches the controller's own health and remediates before anything is
//! escalated to an operator-visible alarm: field-bus retries on a fixed
//! schedule, cache drops under memory pressure, retention cuts under disk
//! pressure, and a software watchdog over the control loop's heartbeat.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::alarm::{kinds, Alarm, Severity};
use crate::cache::CacheManager;
use crate::fieldbus::FieldBus;
use crate::store::{RetentionPolicy, Store};

/// Field-bus reconnect schedule (seconds between probes).
pub const FIELD_BUS_RETRY_DELAYS: [u64; 3] = [5, 15, 60];

const MEMORY_WARN_PERCENT: f64 = 80.0;
const MEMORY_CRITICAL_PERCENT: f64 = 90.0;
const DISK_WARN_PERCENT: f64 = 80.0;
const DISK_CRITICAL_PERCENT: f64 = 90.0;
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
const CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// A second watchdog trip inside this window means the restart failed.
const RESTART_GRACE: Duration = Duration::from_secs(60);

/// Remediation outcomes the control loop applies on its next cycle.
#[derive(Debug)]
pub enum HealingEvent {
    EnterSafeMode(String),
    FieldBusRecovered,
    Alarm(Alarm),
}

/// Escalations the composition root handles (the control loop cannot
/// restart itself).
#[derive(Debug)]
pub enum SupervisorEvent {
    RestartControlLoop,
}

/// Health snapshot for status reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    pub fieldbus_connected: bool,
    pub mqtt_connected: bool,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub control_loop_alive: bool,
    pub fieldbus_failures: u32,
}

struct FieldBusRecovery {
    attempts: u32,
    next_probe_at: Instant,
}

pub struct SelfHealingManager {
    status: RwLock<HealthStatus>,
    heartbeat: Mutex<Instant>,
    recovery: Mutex<Option<FieldBusRecovery>>,
    non_critical_disabled: AtomicBool,
    last_restart_at: Mutex<Option<Instant>>,
    loop_events: mpsc::Sender<HealingEvent>,
    supervisor: mpsc::Sender<SupervisorEvent>,
    store: Arc<Store>,
    cache: Arc<CacheManager>,
    retention: RetentionPolicy,
    max_store_bytes: u64,
}

impl SelfHealingManager {
    pub fn new(
        loop_events: mpsc::Sender<HealingEvent>,
        supervisor: mpsc::Sender<SupervisorEvent>,
        store: Arc<Store>,
        cache: Arc<CacheManager>,
        retention: RetentionPolicy,
        max_store_bytes: u64,
    ) -> Self {
        Self {
            status: RwLock::new(HealthStatus {
                fieldbus_connected: true,
                control_loop_alive: true,
                ..HealthStatus::default()
            }),
            heartbeat: Mutex::new(Instant::now()),
            recovery: Mutex::new(None),
            non_critical_disabled: AtomicBool::new(false),
            last_restart_at: Mutex::new(None),
            loop_events,
            supervisor,
            store,
            cache,
            retention,
            max_store_bytes,
        }
    }

    /// Called by the control loop at the top of every cycle.
    pub fn heartbeat(&self) {
        *self.heartbeat.lock() = Instant::now();
        self.status.write().control_loop_alive = true;
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.heartbeat.lock().elapsed()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.status.write().mqtt_connected = connected;
    }

    pub fn non_critical_disabled(&self) -> bool {
        self.non_critical_disabled.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> HealthStatus {
        self.status.read().clone()
    }

    /// Non-blocking failure report from the control loop. The healing task
    /// runs the `[5, 15, 60]` s probe schedule; exhaustion forces safe mode.
    pub fn report_fieldbus_failure(&self) {
        let mut status = self.status.write();
        status.fieldbus_connected = false;
        status.fieldbus_failures += 1;
        drop(status);

        let mut recovery = self.recovery.lock();
        if recovery.is_none() {
            tracing::warn!(
                "field bus failure, first probe in {}s",
                FIELD_BUS_RETRY_DELAYS[0]
            );
            *recovery = Some(FieldBusRecovery {
                attempts: 0,
                next_probe_at: Instant::now() + Duration::from_secs(FIELD_BUS_RETRY_DELAYS[0]),
            });
        }
    }

    /// Periodic monitor: watchdog, field-bus recovery, memory, disk.
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<dyn FieldBus>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("self-healing manager started");
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("self-healing manager stopping");
                        return;
                    }
                }
            }
            self.check_watchdog().await;
            self.check_fieldbus(bus.as_ref()).await;
            self.check_memory().await;
            self.check_disk().await;
        }
    }

    async fn check_watchdog(&self) {
        if self.heartbeat_age() <= WATCHDOG_TIMEOUT {
            return;
        }
        self.status.write().control_loop_alive = false;

        let restart_already_tried = {
            let mut last_restart = self.last_restart_at.lock();
            match *last_restart {
                Some(at) if at.elapsed() < RESTART_GRACE => true,
                _ => {
                    *last_restart = Some(Instant::now());
                    false
                }
            }
        };
        if restart_already_tried {
            // Restart already tried and the loop is still silent.
            tracing::error!("control loop restart failed, escalating");
            let _ = self
                .loop_events
                .send(HealingEvent::Alarm(Alarm::new(
                    Severity::Critical,
                    kinds::CONTROL_LOOP_RESTART_FAILED,
                    "control loop unresponsive after restart",
                )))
                .await;
        } else {
            tracing::error!(
                age_secs = self.heartbeat_age().as_secs(),
                "watchdog timeout, requesting control loop restart"
            );
            let _ = self.supervisor.send(SupervisorEvent::RestartControlLoop).await;
        }
    }

    async fn check_fieldbus(&self, bus: &dyn FieldBus) {
        let due = {
            let recovery = self.recovery.lock();
            match recovery.as_ref() {
                Some(r) if Instant::now() >= r.next_probe_at => true,
                _ => false,
            }
        };
        if !due {
            return;
        }

        if bus.read_telemetry().await.is_ok() {
            *self.recovery.lock() = None;
            {
                let mut status = self.status.write();
                status.fieldbus_connected = true;
                status.fieldbus_failures = 0;
            }
            tracing::info!("field bus recovered");
            let _ = self.loop_events.send(HealingEvent::FieldBusRecovered).await;
            return;
        }

        let exhausted = {
            let mut recovery = self.recovery.lock();
            if let Some(r) = recovery.as_mut() {
                r.attempts += 1;
                if (r.attempts as usize) < FIELD_BUS_RETRY_DELAYS.len() {
                    let delay = FIELD_BUS_RETRY_DELAYS[r.attempts as usize];
                    tracing::warn!(attempt = r.attempts, "field bus probe failed, next in {delay}s");
                    r.next_probe_at = Instant::now() + Duration::from_secs(delay);
                    false
                } else {
                    *recovery = None;
                    true
                }
            } else {
                false
            }
        };

        if exhausted {
            tracing::error!("field bus retry schedule exhausted");
            let _ = self
                .loop_events
                .send(HealingEvent::EnterSafeMode("field_bus_exhausted".into()))
                .await;
            let _ = self
                .loop_events
                .send(HealingEvent::Alarm(Alarm::new(
                    Severity::Critical,
                    kinds::FIELD_BUS_EXHAUSTED,
                    "field bus unreachable after full retry schedule",
                )))
                .await;
        }
    }

    async fn check_memory(&self) {
        let usage = read_memory_usage_percent();
        self.status.write().memory_usage_percent = usage;

        if usage > MEMORY_CRITICAL_PERCENT {
            tracing::error!(usage, "memory critical, disabling non-critical features");
            self.cache.drop_volatile();
            self.non_critical_disabled.store(true, Ordering::Relaxed);
            let _ = self
                .loop_events
                .send(HealingEvent::Alarm(
                    Alarm::new(
                        Severity::Critical,
                        kinds::MEMORY_CRITICAL,
                        format!("memory usage {usage:.1}%"),
                    )
                    .with_metadata(serde_json::json!({ "usage_percent": usage })),
                ))
                .await;
        } else if usage > MEMORY_WARN_PERCENT {
            tracing::warn!(usage, "memory high, dropping caches");
            self.cache.drop_volatile();
        } else if self.non_critical_disabled.load(Ordering::Relaxed) && usage < MEMORY_WARN_PERCENT
        {
            tracing::info!(usage, "memory recovered, re-enabling non-critical features");
            self.non_critical_disabled.store(false, Ordering::Relaxed);
        }
    }

    async fn check_disk(&self) {
        let usage = self.store.size_bytes() as f64 / self.max_store_bytes.max(1) as f64 * 100.0;
        self.status.write().disk_usage_percent = usage;

        if usage > DISK_CRITICAL_PERCENT {
            tracing::error!(usage, "disk critical, aggressive truncate + compact");
            if let Err(e) = self.store.cleanup(self.retention.aggressive()) {
                tracing::error!("aggressive cleanup failed: {e}");
            }
            if let Err(e) = self.store.compact() {
                tracing::error!("compact failed: {e}");
            }
            let _ = self
                .loop_events
                .send(HealingEvent::Alarm(
                    Alarm::new(
                        Severity::Critical,
                        kinds::DISK_CRITICAL,
                        format!("store at {usage:.1}% of budget"),
                    )
                    .with_metadata(serde_json::json!({ "usage_percent": usage })),
                ))
                .await;
        } else if usage > DISK_WARN_PERCENT {
            tracing::warn!(usage, "disk high, running retention");
            if let Err(e) = self.store.cleanup(self.retention) {
                tracing::error!("retention cleanup failed: {e}");
            }
        }
    }
}

/// Memory usage from /proc/meminfo; 0.0 when unavailable.
fn read_memory_usage_percent() -> f64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0.0;
    };
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    match (field("MemTotal:"), field("MemAvailable:")) {
        (Some(total), Some(available)) if total > 0.0 => (1.0 - available / total) * 100.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizationConfig;
    use crate::fieldbus::{FieldBusError, TelemetrySnapshot, WriteTarget};
    use async_trait::async_trait;

    struct DeadBus;

    #[async_trait]
    impl FieldBus for DeadBus {
        async fn read_telemetry(&self) -> Result<TelemetrySnapshot, FieldBusError> {
            Err(FieldBusError::Timeout("dead".into()))
        }
        async fn write(&self, _target: WriteTarget, _value: f64) -> Result<(), FieldBusError> {
            Err(FieldBusError::Timeout("dead".into()))
        }
        async fn emergency_stop(&self) -> Result<(), FieldBusError> {
            Err(FieldBusError::Timeout("dead".into()))
        }
        async fn probe(&self, _unit_id: u8) -> bool {
            false
        }
    }

    fn manager() -> (Arc<SelfHealingManager>, mpsc::Receiver<HealingEvent>) {
        let (loop_tx, loop_rx) = mpsc::channel(16);
        let (sup_tx, _sup_rx) = mpsc::channel(16);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(CacheManager::new(OptimizationConfig::default()));
        let retention = RetentionPolicy {
            telemetry_hours: 72,
            decisions_days: 30,
            alarms_days: 90,
            queue_days: 7,
        };
        (
            Arc::new(SelfHealingManager::new(
                loop_tx,
                sup_tx,
                store,
                cache,
                retention,
                1024,
            )),
            loop_rx,
        )
    }

    #[test]
    fn test_heartbeat_resets_age() {
        let (healing, _rx) = manager();
        healing.heartbeat();
        assert!(healing.heartbeat_age() < Duration::from_secs(1));
        assert!(healing.status().control_loop_alive);
    }

    #[test]
    fn test_failure_report_schedules_probe() {
        let (healing, _rx) = manager();
        healing.report_fieldbus_failure();
        healing.report_fieldbus_failure();
        let status = healing.status();
        assert!(!status.fieldbus_connected);
        assert_eq!(status.fieldbus_failures, 2);
        // Only one recovery sequence at a time
        assert!(healing.recovery.lock().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_schedule_forces_safe_mode() {
        let (healing, mut rx) = manager();
        healing.report_fieldbus_failure();

        // Make every probe due immediately, then fail it through the ladder.
        let bus = DeadBus;
        for _ in 0..FIELD_BUS_RETRY_DELAYS.len() {
            if let Some(r) = healing.recovery.lock().as_mut() {
                r.next_probe_at = Instant::now();
            }
            healing.check_fieldbus(&bus).await;
        }

        match rx.recv().await.unwrap() {
            HealingEvent::EnterSafeMode(reason) => assert_eq!(reason, "field_bus_exhausted"),
            other => panic!("expected safe mode, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            HealingEvent::Alarm(alarm) => assert_eq!(alarm.kind, kinds::FIELD_BUS_EXHAUSTED),
            other => panic!("expected alarm, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watchdog_requests_restart_once() {
        let (loop_tx, _loop_rx) = mpsc::channel(16);
        let (sup_tx, mut sup_rx) = mpsc::channel(16);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(CacheManager::new(OptimizationConfig::default()));
        let retention = RetentionPolicy {
            telemetry_hours: 72,
            decisions_days: 30,
            alarms_days: 90,
            queue_days: 7,
        };
        let healing = Arc::new(SelfHealingManager::new(
            loop_tx, sup_tx, store, cache, retention, 1024,
        ));

        // Simulate a stale heartbeat
        *healing.heartbeat.lock() = Instant::now() - Duration::from_secs(45);
        healing.check_watchdog().await;

        assert!(matches!(
            sup_rx.recv().await.unwrap(),
            SupervisorEvent::RestartControlLoop
        ));
        assert!(!healing.status().control_loop_alive);
    }

    #[test]
    fn test_memory_read_does_not_panic() {
        let usage = read_memory_usage_percent();
        assert!((0.0..=100.0).contains(&usage));
    }
}
