//! Control Loop
//!
//! The cycle coordinator. Every tick: heartbeat → drain inbound events →
//! read telemetry → safety check → (protective action | decision) →
//! persist → publish/enqueue → sync → sleep to the next boundary.
//!
//! The safety check and its protective field-bus writes run back-to-back
//! with nothing scheduled between them. A cycle that exceeds the sample
//! interval raises `LOOP_OVERRUN` and skips to the next boundary instead of
//! stacking. The loop converts sub-component errors to alarms and
//! remediation, and never crashes.

use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::alarm::{kinds, Alarm, AlarmDebouncer, Severity};
use crate::cache::CacheManager;
use crate::config::{EdgeConfig, EdgePaths};
use crate::engine::{CloudCommand, Decision, DecisionAction, DecisionEngine, OperatingMode};
use crate::fieldbus::{FieldBus, TelemetrySnapshot, WriteTarget};
use crate::healing::{HealingEvent, SelfHealingManager};
use crate::metrics::MetricsCollector;
use crate::mqtt::{CloudLink, IngressEvent, Topics};
use crate::ota::OperationalState;
use crate::safety::{SafetyAction, SafetyManager, SafetyVerdict};
use crate::store::{RetentionPolicy, Store};
use crate::sync::SyncManager;

/// Event receivers live behind shared handles so a watchdog-initiated
/// restart can hand the same queues to a fresh loop instance.
pub type SharedRx<T> = Arc<AsyncMutex<mpsc::Receiver<T>>>;

pub struct ControlLoop<B: FieldBus, L: CloudLink> {
    config: EdgeConfig,
    paths: EdgePaths,
    bus: Arc<B>,
    link: Arc<L>,
    store: Arc<Store>,
    cache: Arc<CacheManager>,
    engine: DecisionEngine,
    safety: SafetyManager,
    sync: SyncManager<L>,
    healing: Arc<SelfHealingManager>,
    metrics: Arc<MetricsCollector>,
    debouncer: AlarmDebouncer,
    ingress_rx: SharedRx<IngressEvent>,
    healing_rx: SharedRx<HealingEvent>,
    topics: Topics,
    last_optimization: Option<Instant>,
    last_cleanup: Option<Instant>,
}

impl<B: FieldBus, L: CloudLink> ControlLoop<B, L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EdgeConfig,
        paths: EdgePaths,
        bus: Arc<B>,
        link: Arc<L>,
        store: Arc<Store>,
        cache: Arc<CacheManager>,
        engine: DecisionEngine,
        safety: SafetyManager,
        healing: Arc<SelfHealingManager>,
        metrics: Arc<MetricsCollector>,
        ingress_rx: SharedRx<IngressEvent>,
        healing_rx: SharedRx<HealingEvent>,
    ) -> Self {
        let topics = Topics::new(&config.site_id);
        let sync = SyncManager::new(
            store.clone(),
            link.clone(),
            topics.clone(),
            config.data.queue_soft_limit,
            config.data.downsample_keep_1_in,
        );
        Self {
            config,
            paths,
            bus,
            link,
            store,
            cache,
            engine,
            safety,
            sync,
            healing,
            metrics,
            debouncer: AlarmDebouncer::default(),
            ingress_rx,
            healing_rx,
            topics,
            last_optimization: None,
            last_cleanup: None,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.engine.mode()
    }

    /// Run until shutdown. Cancellation happens only between cycles.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.control.sample_interval_secs.max(1));
        tracing::info!(
            site_id = %self.config.site_id,
            interval_secs = interval.as_secs(),
            "control loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            self.cycle().await;
            let elapsed = started.elapsed();
            self.metrics.record_cycle(elapsed.as_secs_f64() * 1000.0);

            if elapsed > interval {
                // Skip the missed boundary rather than stacking cycles.
                self.metrics.record_overrun();
                tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "cycle overrun");
                self.raise_alarm(
                    Alarm::new(
                        Severity::Warning,
                        kinds::LOOP_OVERRUN,
                        format!("cycle took {} ms", elapsed.as_millis()),
                    )
                    .with_metadata(serde_json::json!({
                        "elapsed_ms": elapsed.as_millis() as u64,
                        "budget_ms": interval.as_millis() as u64,
                    })),
                )
                .await;
                let into_next = Duration::from_nanos(
                    (elapsed.as_nanos() % interval.as_nanos()) as u64,
                );
                tokio::select! {
                    _ = tokio::time::sleep(interval - into_next) => {}
                    _ = shutdown.changed() => {}
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(interval - elapsed) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        tracing::info!("control loop stopped");
    }

    /// One full control cycle.
    async fn cycle(&mut self) {
        // ── 1. Watchdog heartbeat ────────────────────────────────────────
        self.healing.heartbeat();
        self.metrics.set_mqtt_connected(self.link.is_connected());
        self.healing.set_mqtt_connected(self.link.is_connected());

        // ── 2. Inbound events queued since the last cycle ────────────────
        self.drain_events().await;

        // Cache view is frozen at cycle start: updates arriving from the
        // subscription task mid-cycle are only visible to the next cycle.
        let cache_view = self.cache.snapshot();

        // ── 3. Read telemetry ────────────────────────────────────────────
        let snapshot = match self.bus.read_telemetry().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("telemetry read failed: {e}");
                self.healing.report_fieldbus_failure();
                return;
            }
        };
        self.metrics
            .record_telemetry(snapshot.soc, snapshot.power_kw, snapshot.temp_max);

        // ── 4. Safety check, protective write in the same step ───────────
        let verdict = self.safety.check(&snapshot, self.healing.heartbeat_age());
        if !verdict.ok {
            self.metrics.record_safety_violation();
            self.execute_protective(&verdict).await;
            self.persist_telemetry(&snapshot);
            self.report_safety_event(&verdict).await;
            self.write_operational_state(&snapshot);
            return; // optimization is skipped this cycle
        }

        // ── 5. Persist the sample ────────────────────────────────────────
        self.persist_telemetry(&snapshot);

        // ── 6. Optimization on its own cadence ───────────────────────────
        let optimization_due = match self.last_optimization {
            Some(at) => {
                at.elapsed() >= Duration::from_secs(self.config.control.optimization_interval_secs)
            }
            None => true,
        };
        if optimization_due {
            self.last_optimization = Some(Instant::now());
            let demand_kw = self.estimate_demand_kw(&snapshot);
            let hour = chrono::Local::now().hour() as usize;
            let decision = self.engine.decide(&snapshot, &cache_view, demand_kw, hour);
            self.metrics.record_decision();
            self.apply_decision(&decision).await;
            self.persist_and_publish_decision(&decision).await;
        }

        // ── 7. Heartbeat to the cloud (QoS-0, best effort) ───────────────
        if self.link.is_connected() {
            let payload = serde_json::json!({
                "mode": self.engine.mode().as_str(),
                "timestamp": Utc::now().to_rfc3339(),
            });
            let _ = self
                .link
                .publish(&self.topics.heartbeat(), payload.to_string().into_bytes())
                .await;
        }

        // ── 8. Sync step / offline buffering ─────────────────────────────
        if self.link.is_connected() {
            self.sync.step(&snapshot).await;
        } else if !self.healing.non_critical_disabled() {
            if let Err(e) = self.sync.enqueue_telemetry(&snapshot) {
                self.handle_store_error("telemetry enqueue", e).await;
            }
        }

        // ── 9. Periodic retention cleanup ────────────────────────────────
        let cleanup_due = self.last_cleanup.is_some_and(|at| {
            at.elapsed() >= Duration::from_secs(self.config.data.cleanup_interval_hours * 3600)
        });
        if cleanup_due {
            if let Err(e) = self.store.cleanup(self.retention_policy()) {
                self.handle_store_error("cleanup", e).await;
            }
        }
        if cleanup_due || self.last_cleanup.is_none() {
            self.last_cleanup = Some(Instant::now());
        }

        if let Ok(depth) = self.store.queue_depth() {
            self.metrics.set_queue_depth(depth);
        }
        self.write_operational_state(&snapshot);
    }

    /// Demand estimate until a meter channel is wired: battery power plus
    /// the configured base site load.
    fn estimate_demand_kw(&self, snapshot: &TelemetrySnapshot) -> f64 {
        snapshot.power_kw.abs() + self.config.optimization.peak_shaving.demand_base_load_kw
    }

    fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            telemetry_hours: self.config.data.telemetry_retention_hours,
            decisions_days: self.config.data.decisions_retention_days,
            alarms_days: self.config.data.alarms_retention_days,
            queue_days: self.config.data.queue_retention_days,
        }
    }

    async fn drain_events(&mut self) {
        let mut ingress = Vec::new();
        if let Ok(mut rx) = self.ingress_rx.clone().try_lock_owned() {
            while let Ok(event) = rx.try_recv() {
                ingress.push(event);
            }
        }
        for event in ingress {
            match event {
                IngressEvent::Command(command) => self.handle_command(command).await,
                IngressEvent::ConfigApplied => self.engine.note_cloud_contact(),
                IngressEvent::ConfigInvalid(detail) => {
                    self.raise_alarm(Alarm::new(
                        Severity::Warning,
                        kinds::CONFIG_INVALID,
                        detail,
                    ))
                    .await;
                }
            }
        }

        let mut healing = Vec::new();
        if let Ok(mut rx) = self.healing_rx.clone().try_lock_owned() {
            while let Ok(event) = rx.try_recv() {
                healing.push(event);
            }
        }
        for event in healing {
            match event {
                HealingEvent::EnterSafeMode(reason) => self.enter_safe_mode(&reason).await,
                HealingEvent::FieldBusRecovered => {
                    tracing::info!("field bus recovered (operator reset clears safe mode)");
                }
                HealingEvent::Alarm(alarm) => self.raise_alarm(alarm).await,
            }
        }
    }

    async fn handle_command(&mut self, command: CloudCommand) {
        match command.action.as_str() {
            "RESET_SAFE_MODE" => {
                let healthy = self.healing.status().fieldbus_connected;
                let critical = self.store.active_critical_alarm().unwrap_or(true);
                if healthy && !critical {
                    if self.engine.reset_safe_mode() {
                        self.raise_alarm(Alarm::new(
                            Severity::Advisory,
                            kinds::SAFE_MODE_EXITED,
                            "operator reset accepted",
                        ))
                        .await;
                    }
                } else {
                    tracing::warn!(
                        healthy,
                        critical,
                        "safe mode reset refused, conditions not met"
                    );
                }
            }
            "ACKNOWLEDGE_ALARM" => {
                if let Some(id) = command.alarm_id {
                    if let Err(e) = self.store.acknowledge_alarm(id) {
                        tracing::error!("alarm ack failed: {e}");
                    }
                }
            }
            _ => self.engine.receive_cloud_command(&command),
        }
    }

    /// Map the verdict's action to its field-bus writes. Runs immediately
    /// after the safety check with no awaits in between besides the writes
    /// themselves.
    async fn execute_protective(&mut self, verdict: &SafetyVerdict) {
        tracing::warn!(
            action = verdict.action.as_str(),
            parameter = %verdict.parameter,
            value = verdict.value,
            limit = verdict.limit,
            "executing protective action"
        );

        match verdict.action {
            SafetyAction::EmergencyStop => {
                // Surfaced to self-healing independently of the ack.
                if let Err(e) = self.bus.emergency_stop().await {
                    tracing::error!("emergency stop write failed: {e}");
                    self.healing.report_fieldbus_failure();
                }
                let _ = self.bus.write(WriteTarget::ChargeEnable, 0.0).await;
                let _ = self.bus.write(WriteTarget::DischargeEnable, 0.0).await;
            }
            SafetyAction::StopCharge => {
                let _ = self.bus.write(WriteTarget::ChargeEnable, 0.0).await;
                let _ = self.bus.write(WriteTarget::PowerSetpoint, 0.0).await;
            }
            SafetyAction::StopDischarge => {
                let _ = self.bus.write(WriteTarget::DischargeEnable, 0.0).await;
                let _ = self.bus.write(WriteTarget::PowerSetpoint, 0.0).await;
            }
            SafetyAction::StopAll => {
                let _ = self.bus.write(WriteTarget::PowerSetpoint, 0.0).await;
                let _ = self.bus.write(WriteTarget::ChargeEnable, 0.0).await;
                let _ = self.bus.write(WriteTarget::DischargeEnable, 0.0).await;
            }
            SafetyAction::ReducePower => {
                // Halve the present power until the reading clears.
                let reduced = self.half_current_power();
                let _ = self.bus.write(WriteTarget::PowerSetpoint, reduced).await;
            }
            SafetyAction::None => {}
        }
    }

    /// Latest persisted power halved, preserving direction.
    fn half_current_power(&self) -> f64 {
        match self.store.latest_telemetry() {
            Ok(Some(snapshot)) => snapshot.power_kw * 0.5,
            _ => 0.0,
        }
    }

    async fn report_safety_event(&mut self, verdict: &SafetyVerdict) {
        let kind = match verdict.action {
            SafetyAction::EmergencyStop => kinds::SAFETY_EMERGENCY_STOP,
            SafetyAction::StopCharge => kinds::SAFETY_STOP_CHARGE,
            SafetyAction::StopDischarge => kinds::SAFETY_STOP_DISCHARGE,
            SafetyAction::StopAll => kinds::SAFETY_STOP_ALL,
            SafetyAction::ReducePower => kinds::SAFETY_REDUCE_POWER,
            SafetyAction::None => kinds::SAFETY_WARNING,
        };
        let alarm = Alarm::new(verdict.severity, kind, verdict.reason.clone()).with_metadata(
            serde_json::json!({
                "parameter": verdict.parameter,
                "value": verdict.value,
                "limit": verdict.limit,
            }),
        );
        self.raise_alarm(alarm).await;
    }

    async fn enter_safe_mode(&mut self, reason: &str) {
        if self.engine.mode() == OperatingMode::Safe {
            return;
        }
        self.engine.enter_safe_mode(reason);
        self.raise_alarm(Alarm::new(
            Severity::Critical,
            kinds::SAFE_MODE_ENTERED,
            reason.to_string(),
        ))
        .await;
    }

    /// Persist an alarm, then publish it through the cooldown filter.
    /// Suppressed repeats are stored but not sent.
    async fn raise_alarm(&mut self, alarm: Alarm) {
        if let Err(e) = self.store.save_alarm(&alarm) {
            tracing::error!("alarm persist failed: {e}");
        }
        if !self.debouncer.should_publish(&alarm.kind) {
            return;
        }
        self.metrics.record_alarm();
        let payload = match serde_json::to_vec(&alarm) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("alarm serialization failed: {e}");
                return;
            }
        };
        if self.link.is_connected() {
            if self
                .link
                .publish_confirmed(&self.topics.alarms(), payload.clone())
                .await
                .is_ok()
            {
                return;
            }
        }
        if let Err(e) = self.sync.enqueue_alarm(&payload) {
            tracing::error!("alarm enqueue failed: {e}");
        }
    }

    async fn apply_decision(&mut self, decision: &Decision) {
        let result = match decision.action {
            DecisionAction::Idle => self.bus.write(WriteTarget::PowerSetpoint, 0.0).await,
            DecisionAction::Charge => {
                let power = decision.power_kw.abs();
                let r1 = self.bus.write(WriteTarget::ChargeEnable, 1.0).await;
                let r2 = self.bus.write(WriteTarget::DischargeEnable, 0.0).await;
                let r3 = self.bus.write(WriteTarget::PowerSetpoint, power).await;
                r1.and(r2).and(r3)
            }
            DecisionAction::Discharge => {
                let power = decision.power_kw.abs();
                let r1 = self.bus.write(WriteTarget::ChargeEnable, 0.0).await;
                let r2 = self.bus.write(WriteTarget::DischargeEnable, 1.0).await;
                let r3 = self.bus.write(WriteTarget::PowerSetpoint, -power).await;
                r1.and(r2).and(r3)
            }
            DecisionAction::EmergencyStop => self.bus.emergency_stop().await,
        };
        match result {
            Ok(()) => tracing::info!(
                action = ?decision.action,
                power_kw = decision.power_kw,
                reason = %decision.reason,
                "decision executed"
            ),
            Err(e) => {
                tracing::error!("decision write failed: {e}");
                self.healing.report_fieldbus_failure();
            }
        }
    }

    async fn persist_and_publish_decision(&mut self, decision: &Decision) {
        if let Err(e) = self.store.save_decision(decision) {
            self.handle_store_error("decision persist", e).await;
        }
        let payload = match serde_json::to_vec(decision) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("decision serialization failed: {e}");
                return;
            }
        };
        if self.link.is_connected() {
            if self
                .link
                .publish_confirmed(&self.topics.decisions(), payload.clone())
                .await
                .is_ok()
            {
                return;
            }
        }
        if let Err(e) = self.sync.enqueue_decision(&payload) {
            self.handle_store_error("decision enqueue", e).await;
        }
    }

    fn persist_telemetry(&self, snapshot: &TelemetrySnapshot) {
        if let Err(e) = self.store.save_telemetry(snapshot) {
            tracing::error!("telemetry persist failed: {e}");
        }
    }

    async fn handle_store_error(&mut self, context: &str, error: crate::store::StoreError) {
        tracing::error!("{context} failed: {error}");
        if error.is_disk_full() {
            if let Err(e) = self.store.cleanup(self.retention_policy().aggressive()) {
                tracing::error!("emergency retention cut failed: {e}");
            }
            self.raise_alarm(Alarm::new(
                Severity::Critical,
                kinds::DISK_CRITICAL,
                format!("store write failed: {error}"),
            ))
            .await;
        } else {
            self.raise_alarm(Alarm::new(
                Severity::Alarm,
                kinds::STORE_WRITE_FAILED,
                format!("{context}: {error}"),
            ))
            .await;
        }
    }

    /// State file read by the OTA safety gate and the post-reboot verifier.
    fn write_operational_state(&self, snapshot: &TelemetrySnapshot) {
        let state = OperationalState {
            soc_percent: snapshot.soc,
            power_kw: snapshot.power_kw,
            active_alarm_critical: self.store.active_critical_alarm().unwrap_or(false),
            island_mode: self.engine.grid_state() == crate::controllers::GridState::IslandMode,
            updated_at: Utc::now(),
        };
        if let Err(e) = state.write(&self.paths.operational_state) {
            tracing::debug!("operational state write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CloudSetpoint;
    use crate::config::OptimizationConfig;
    use crate::mqtt::MqttError;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockBus {
        snapshot: PlMutex<Option<TelemetrySnapshot>>,
        writes: PlMutex<Vec<(WriteTarget, f64)>>,
        emergency_stops: AtomicU32,
        fail_reads: AtomicBool,
    }

    impl MockBus {
        fn with_snapshot(snapshot: TelemetrySnapshot) -> Self {
            Self {
                snapshot: PlMutex::new(Some(snapshot)),
                writes: PlMutex::new(Vec::new()),
                emergency_stops: AtomicU32::new(0),
                fail_reads: AtomicBool::new(false),
            }
        }

        fn writes(&self) -> Vec<(WriteTarget, f64)> {
            self.writes.lock().clone()
        }
    }

    #[async_trait]
    impl FieldBus for MockBus {
        async fn read_telemetry(&self) -> Result<TelemetrySnapshot, crate::fieldbus::FieldBusError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(crate::fieldbus::FieldBusError::Timeout("mock".into()));
            }
            Ok(self.snapshot.lock().clone().expect("snapshot configured"))
        }

        async fn write(
            &self,
            target: WriteTarget,
            value: f64,
        ) -> Result<(), crate::fieldbus::FieldBusError> {
            self.writes.lock().push((target, value));
            Ok(())
        }

        async fn emergency_stop(&self) -> Result<(), crate::fieldbus::FieldBusError> {
            self.emergency_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn probe(&self, _unit_id: u8) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct MockLink {
        connected: AtomicBool,
        published: PlMutex<Vec<(String, Vec<u8>)>>,
        confirmed: PlMutex<Vec<(String, Vec<u8>)>>,
    }

    impl MockLink {
        fn online() -> Self {
            let link = Self::default();
            link.connected.store(true, Ordering::SeqCst);
            link
        }
    }

    #[async_trait]
    impl CloudLink for MockLink {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
            self.published.lock().push((topic.to_string(), payload));
            Ok(())
        }
        async fn publish_confirmed(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
            self.confirmed.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn snapshot(soc: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            soc,
            soh: 98.0,
            pack_voltage: 48.0,
            current: 10.0,
            power_kw: 20.0,
            temp_min: 20.0,
            temp_max: 30.0,
            temp_avg: 25.0,
            grid_frequency: 60.0,
            grid_voltage: 220.0,
            cell_voltage_min: 3.20,
            cell_voltage_max: 3.22,
            insulation_resistance_kohm: None,
            smoke_level: None,
            gas_ppm: None,
            captured_at: Utc::now(),
            captured_mono: Instant::now(),
        }
    }

    struct Fixture {
        control: ControlLoop<MockBus, MockLink>,
        bus: Arc<MockBus>,
        link: Arc<MockLink>,
        store: Arc<Store>,
        cache: Arc<CacheManager>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(bus: MockBus, link: MockLink) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let paths = EdgePaths::under(tmp.path());
        let mut config = EdgeConfig::default();
        config.site_id = "site-test".into();

        let bus = Arc::new(bus);
        let link = Arc::new(link);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(CacheManager::new(OptimizationConfig::default()));
        let engine = DecisionEngine::new(&config, cache.clone());
        let safety = SafetyManager::with_defaults();
        let metrics = Arc::new(MetricsCollector::new());

        let (_ingress_tx, ingress_rx) = mpsc::channel(16);
        let (_healing_tx, healing_rx) = mpsc::channel(16);
        let ingress_rx = Arc::new(AsyncMutex::new(ingress_rx));
        let healing_rx = Arc::new(AsyncMutex::new(healing_rx));
        let (loop_tx, _loop_rx) = mpsc::channel(16);
        let (sup_tx, _sup_rx) = mpsc::channel(16);
        let healing = Arc::new(SelfHealingManager::new(
            loop_tx,
            sup_tx,
            store.clone(),
            cache.clone(),
            RetentionPolicy {
                telemetry_hours: 72,
                decisions_days: 30,
                alarms_days: 90,
                queue_days: 7,
            },
            1 << 20,
        ));

        let control = ControlLoop::new(
            config,
            paths,
            bus.clone(),
            link.clone(),
            store.clone(),
            cache.clone(),
            engine,
            safety,
            healing,
            metrics,
            ingress_rx,
            healing_rx,
        );
        Fixture {
            control,
            bus,
            link,
            store,
            cache,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn test_online_nominal_executes_cloud_setpoint() {
        let mut f = fixture(MockBus::with_snapshot(snapshot(50.0)), MockLink::online());
        f.cache.set_cloud_setpoint(CloudSetpoint {
            action: DecisionAction::Charge,
            power_kw: 30.0,
            reason: "cheap overnight rate".into(),
        });

        f.control.cycle().await;

        let writes = f.bus.writes();
        assert!(writes.contains(&(WriteTarget::ChargeEnable, 1.0)));
        assert!(writes.contains(&(WriteTarget::DischargeEnable, 0.0)));
        assert!(writes.contains(&(WriteTarget::PowerSetpoint, 30.0)));

        // Decision published QoS-1, heartbeat + telemetry QoS-0
        let confirmed = f.link.confirmed.lock();
        assert!(confirmed.iter().any(|(t, _)| t.ends_with("/decisions")));
        let published = f.link.published.lock();
        assert!(published.iter().any(|(t, _)| t.ends_with("/heartbeat")));
        assert!(published.iter().any(|(t, _)| t.ends_with("/telemetry")));
    }

    #[tokio::test]
    async fn test_safety_overrides_optimization() {
        let mut hot = snapshot(50.0);
        hot.temp_max = 62.0; // above critical_high = 60
        let mut f = fixture(MockBus::with_snapshot(hot), MockLink::online());
        f.cache.set_cloud_setpoint(CloudSetpoint {
            action: DecisionAction::Discharge,
            power_kw: 50.0,
            reason: "peak price".into(),
        });

        f.control.cycle().await;

        // Emergency stop path: coil write plus both enables cleared
        assert_eq!(f.bus.emergency_stops.load(Ordering::SeqCst), 1);
        let writes = f.bus.writes();
        assert!(writes.contains(&(WriteTarget::ChargeEnable, 0.0)));
        assert!(writes.contains(&(WriteTarget::DischargeEnable, 0.0)));
        // The engine never ran: no setpoint write, no decision published
        assert!(!writes.iter().any(|(t, _)| *t == WriteTarget::PowerSetpoint));
        let confirmed = f.link.confirmed.lock();
        assert!(!confirmed.iter().any(|(t, _)| t.ends_with("/decisions")));
        // The alarm went out on the alarms topic
        let alarm = confirmed
            .iter()
            .find(|(t, _)| t.ends_with("/alarms"))
            .expect("alarm published");
        let parsed: Alarm = serde_json::from_slice(&alarm.1).unwrap();
        assert_eq!(parsed.kind, kinds::SAFETY_EMERGENCY_STOP);
    }

    #[tokio::test]
    async fn test_offline_cycle_enqueues_instead_of_publishing() {
        let mut f = fixture(MockBus::with_snapshot(snapshot(50.0)), MockLink::default());
        f.cache.set_cloud_setpoint(CloudSetpoint {
            action: DecisionAction::Charge,
            power_kw: 10.0,
            reason: String::new(),
        });

        f.control.cycle().await;

        assert!(f.link.published.lock().is_empty());
        assert!(f.link.confirmed.lock().is_empty());
        // Decision + telemetry both queued for later sync
        assert!(f.store.queue_depth().unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_fieldbus_failure_reports_to_healing() {
        let bus = MockBus::with_snapshot(snapshot(50.0));
        bus.fail_reads.store(true, Ordering::SeqCst);
        let mut f = fixture(bus, MockLink::online());

        f.control.cycle().await;

        let status = f.control.healing.status();
        assert!(!status.fieldbus_connected);
        assert_eq!(status.fieldbus_failures, 1);
        // Nothing was written to the bus
        assert!(f.bus.writes().is_empty());
    }

    #[tokio::test]
    async fn test_operational_state_written_each_cycle() {
        let mut f = fixture(MockBus::with_snapshot(snapshot(55.0)), MockLink::online());
        f.control.cycle().await;

        let state = OperationalState::read(&f.control.paths.operational_state).unwrap();
        assert_eq!(state.soc_percent, 55.0);
        assert!(!state.island_mode);
        assert!(!state.active_alarm_critical);
    }

    #[tokio::test]
    async fn test_optimization_respects_interval() {
        let mut f = fixture(MockBus::with_snapshot(snapshot(50.0)), MockLink::online());
        f.cache.set_cloud_setpoint(CloudSetpoint {
            action: DecisionAction::Charge,
            power_kw: 30.0,
            reason: String::new(),
        });

        f.control.cycle().await;
        let first = f.bus.writes().len();
        // Second cycle within the 5 s optimization interval: no new
        // decision writes, only the passive steps.
        f.control.cycle().await;
        assert_eq!(f.bus.writes().len(), first);
    }
}
