//! Decision Engine
//!
//! Mode-aware arbiter composing the sub-controllers under a fixed,
//! auditable priority order:
//!
//! 1. SAFETY      - handled by the control loop before this engine runs
//! 2. GRID_CODE   - black start / grid failure response
//! 3. CONTRACTUAL - peak shaving (protect the demand limit)
//! 4. ECONOMIC    - cloud setpoint, solar self-consumption, arbitrage
//! 5. LONGEVITY   - default idle
//!
//! The engine performs no I/O: it returns a `Decision` value and the
//! control loop executes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CacheManager, CacheSnapshot, CloudSetpoint};
use crate::config::EdgeConfig;
use crate::controllers::{
    ArbitrageController, BlackStartController, ControllerDecision, GridState,
    PeakShavingController, SolarSelfConsumptionController,
};
use crate::fieldbus::TelemetrySnapshot;

/// What the battery is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Idle,
    Charge,
    Discharge,
    EmergencyStop,
}

/// Why the battery is asked to do it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionPriority {
    Safety,
    GridCode,
    Contractual,
    Economic,
    Longevity,
}

/// Operating modes, with transitions:
/// `online` goes `autonomous` after cloud silence and back on contact;
/// any mode enters `safe` on a critical fault; `safe` leaves only through
/// an operator reset, into `autonomous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    Online,
    Autonomous,
    Safe,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Online => "ONLINE",
            OperatingMode::Autonomous => "AUTONOMOUS",
            OperatingMode::Safe => "SAFE",
        }
    }
}

/// One arbitrated decision per optimization tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    /// Magnitude only; the action carries the direction
    pub power_kw: f64,
    pub priority: DecisionPriority,
    pub reason: String,
    pub mode: OperatingMode,
    pub issued_at: DateTime<Utc>,
}

/// Command received on the per-site commands topic. Setpoint commands carry
/// CHARGE/DISCHARGE/IDLE; operator commands use the other actions. Updates
/// for prices and peak-shaving config may ride along.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudCommand {
    pub action: String,
    #[serde(default)]
    pub power_kw: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub prices: Option<Vec<f64>>,
    #[serde(default)]
    pub peak_shaving: Option<PeakShavingUpdate>,
    #[serde(default)]
    pub alarm_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeakShavingUpdate {
    pub demand_limit_kw: f64,
    pub trigger_percent: f64,
}

/// The edge decision engine.
pub struct DecisionEngine {
    site_id: String,
    mode: OperatingMode,
    cache: Arc<CacheManager>,
    last_cloud_contact: Instant,
    cloud_timeout: Duration,
    max_charge_power_kw: f64,
    max_discharge_power_kw: f64,
    safe_mode_cap_kw: f64,
    safe_min_soc: f64,
    safe_max_soc: f64,
    arbitrage: ArbitrageController,
    peak_shaving: PeakShavingController,
    solar: SolarSelfConsumptionController,
    black_start: BlackStartController,
}

impl DecisionEngine {
    pub fn new(config: &EdgeConfig, cache: Arc<CacheManager>) -> Self {
        let opt = &config.optimization;
        let battery = &config.battery;
        Self {
            site_id: config.site_id.clone(),
            mode: OperatingMode::Online,
            cache,
            last_cloud_contact: Instant::now(),
            cloud_timeout: Duration::from_secs(config.control.cloud_timeout_minutes * 60),
            max_charge_power_kw: battery.max_charge_power_kw,
            max_discharge_power_kw: battery.max_discharge_power_kw,
            safe_mode_cap_kw: config.control.safe_mode_cap_kw,
            safe_min_soc: opt.safe_mode.min_soc,
            safe_max_soc: opt.safe_mode.max_soc,
            arbitrage: ArbitrageController::new(
                opt.arbitrage.clone(),
                battery.max_charge_power_kw,
                battery.max_discharge_power_kw,
            ),
            peak_shaving: PeakShavingController::new(
                opt.peak_shaving.clone(),
                battery.max_discharge_power_kw,
            ),
            solar: SolarSelfConsumptionController::new(
                opt.solar.clone(),
                battery.max_charge_power_kw,
                battery.max_discharge_power_kw,
            ),
            black_start: BlackStartController::new(220.0, 60.0),
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn grid_state(&self) -> GridState {
        self.black_start.state()
    }

    /// Process a setpoint command from the cloud. Any valid command is
    /// proof of cloud contact and restores ONLINE from AUTONOMOUS.
    pub fn receive_cloud_command(&mut self, command: &CloudCommand) {
        self.last_cloud_contact = Instant::now();
        if self.mode == OperatingMode::Autonomous {
            tracing::info!("cloud contact restored, mode AUTONOMOUS -> ONLINE");
            self.mode = OperatingMode::Online;
        }

        if let Some(action) = parse_setpoint_action(&command.action) {
            self.cache.set_cloud_setpoint(CloudSetpoint {
                action,
                power_kw: command.power_kw.abs(),
                reason: command.reason.clone(),
            });
        }
        if let Some(prices) = &command.prices {
            self.cache.update_prices(prices);
        }
        if let Some(update) = &command.peak_shaving {
            self.peak_shaving
                .update_config(update.demand_limit_kw, update.trigger_percent);
        }
    }

    /// Config messages also count as cloud contact.
    pub fn note_cloud_contact(&mut self) {
        self.last_cloud_contact = Instant::now();
        if self.mode == OperatingMode::Autonomous {
            tracing::info!("cloud contact restored, mode AUTONOMOUS -> ONLINE");
            self.mode = OperatingMode::Online;
        }
    }

    /// Force safe mode. Exiting requires an operator reset.
    pub fn enter_safe_mode(&mut self, reason: &str) {
        if self.mode != OperatingMode::Safe {
            tracing::error!(site_id = %self.site_id, reason, "entering safe mode");
            self.mode = OperatingMode::Safe;
        }
    }

    /// Operator reset: leaves safe mode into AUTONOMOUS (the next cloud
    /// contact restores ONLINE). Returns false when not in safe mode.
    pub fn reset_safe_mode(&mut self) -> bool {
        if self.mode != OperatingMode::Safe {
            return false;
        }
        tracing::warn!(site_id = %self.site_id, "operator reset, mode SAFE -> AUTONOMOUS");
        self.mode = OperatingMode::Autonomous;
        true
    }

    fn check_mode(&mut self) {
        if self.mode == OperatingMode::Online
            && self.last_cloud_contact.elapsed() > self.cloud_timeout
        {
            tracing::warn!(
                offline_minutes = self.last_cloud_contact.elapsed().as_secs() / 60,
                "no cloud contact, mode ONLINE -> AUTONOMOUS"
            );
            self.mode = OperatingMode::Autonomous;
        }
    }

    /// Arbitrate one decision. `demand_kw` is the site demand estimate and
    /// `hour` the local hour used for tariff/solar lookups.
    pub fn decide(
        &mut self,
        snapshot: &TelemetrySnapshot,
        cache: &CacheSnapshot,
        demand_kw: f64,
        hour: usize,
    ) -> Decision {
        self.check_mode();

        let max_power = self.max_charge_power_kw.min(self.max_discharge_power_kw);

        // Keep the grid machine current even when its output is not used.
        let grid_state = self
            .black_start
            .process(snapshot.grid_frequency, snapshot.grid_voltage);

        // Safe mode narrows everything down to SOC maintenance; every
        // decision it emits is LONGEVITY and capped.
        if self.mode == OperatingMode::Safe {
            return self.safe_mode_decision(snapshot.soc);
        }

        // ── PRIORITY 2: GRID_CODE ────────────────────────────────────────
        if grid_state != GridState::GridConnected {
            return self.grid_code_decision(grid_state, snapshot.soc);
        }

        // ── PRIORITY 3: CONTRACTUAL ──────────────────────────────────────
        let shaving = self.peak_shaving.decide(demand_kw, snapshot.soc, max_power);
        if shaving.is_active() {
            return self.build(shaving, DecisionPriority::Contractual);
        }

        // ── PRIORITY 4: ECONOMIC ─────────────────────────────────────────
        if self.mode == OperatingMode::Online {
            if let Some(setpoint) = &cache.cloud_setpoint {
                return self.build(
                    ControllerDecision {
                        action: setpoint.action,
                        power_kw: setpoint.power_kw.abs(),
                        reason: format!("cloud setpoint: {}", nonempty(&setpoint.reason)),
                    },
                    DecisionPriority::Economic,
                );
            }
        }

        // AUTONOMOUS (or online with a stale setpoint): local strategies.
        let solar_kw = cache.solar_kw_at_hour(hour);
        if solar_kw > 0.5 {
            let solar = self
                .solar
                .decide(snapshot.soc, solar_kw, snapshot.power_kw.abs(), max_power);
            if solar.is_active() {
                return self.build(autonomous(solar), DecisionPriority::Economic);
            }
        }

        let price = cache.prices[hour.min(23)];
        let arb = self.arbitrage.decide(snapshot.soc, price, max_power);
        if arb.is_active() {
            return self.build(autonomous(arb), DecisionPriority::Economic);
        }

        // ── PRIORITY 5: LONGEVITY ────────────────────────────────────────
        self.build(autonomous(arb), DecisionPriority::Longevity)
    }

    fn safe_mode_decision(&self, soc: f64) -> Decision {
        let cap = self.safe_mode_cap_kw;
        let decision = if soc > self.safe_max_soc {
            ControllerDecision::discharge(
                cap,
                format!("[SAFE MODE] soc {soc:.1}% > {:.1}%", self.safe_max_soc),
            )
        } else if soc < self.safe_min_soc {
            ControllerDecision::charge(
                cap,
                format!("[SAFE MODE] soc {soc:.1}% < {:.1}%", self.safe_min_soc),
            )
        } else {
            ControllerDecision::idle("[SAFE MODE] soc within safe band")
        };
        self.build(decision, DecisionPriority::Longevity)
    }

    fn grid_code_decision(&self, state: GridState, soc: f64) -> Decision {
        let decision = match state {
            GridState::GridFailureDetected => {
                ControllerDecision::idle("grid failure detected, preparing transfer")
            }
            GridState::Transferring => ControllerDecision::idle("transferring to island mode"),
            GridState::IslandMode => {
                // Serve island loads; conserve harder as the pack drains.
                let power = self
                    .max_discharge_power_kw
                    .min((soc * 0.5).max(10.0));
                ControllerDecision::discharge(
                    power,
                    format!("island mode, serving loads (soc {soc:.1}%)"),
                )
            }
            GridState::Reconnecting => ControllerDecision::idle("grid recovery: reconnecting"),
            GridState::Synchronizing => ControllerDecision::idle("grid recovery: synchronizing"),
            GridState::GridConnected => ControllerDecision::idle("grid nominal"),
        };
        self.build(decision, DecisionPriority::GridCode)
    }

    fn build(&self, decision: ControllerDecision, priority: DecisionPriority) -> Decision {
        Decision {
            action: decision.action,
            power_kw: (decision.power_kw * 100.0).round() / 100.0,
            priority,
            reason: decision.reason,
            mode: self.mode,
            issued_at: Utc::now(),
        }
    }

    /// Force the cloud-contact timer expired (test hook).
    #[cfg(test)]
    pub fn expire_cloud_contact(&mut self) {
        self.cloud_timeout = Duration::ZERO;
    }
}

fn parse_setpoint_action(action: &str) -> Option<DecisionAction> {
    match action {
        "CHARGE" => Some(DecisionAction::Charge),
        "DISCHARGE" => Some(DecisionAction::Discharge),
        "IDLE" => Some(DecisionAction::Idle),
        _ => None,
    }
}

fn autonomous(mut decision: ControllerDecision) -> ControllerDecision {
    decision.reason = format!("[AUTONOMOUS] {}", decision.reason);
    decision
}

fn nonempty(reason: &str) -> &str {
    if reason.is_empty() {
        "optimized"
    } else {
        reason
    }
}
