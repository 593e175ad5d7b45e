//! Peak shaving
//!
//! Protects the contracted demand limit: at or above the trigger level the
//! battery discharges exactly the excess. A hysteresis latch keeps the
//! controller engaged until demand falls below 70% of the trigger, so a
//! demand hovering around the limit does not toggle the battery.

use super::ControllerDecision;
use crate::config::PeakShavingConfig;

/// Release point as a fraction of the trigger level.
const RELEASE_FRACTION: f64 = 0.7;

pub struct PeakShavingController {
    config: PeakShavingConfig,
    max_discharge_kw: f64,
    shaving: bool,
}

impl PeakShavingController {
    pub fn new(config: PeakShavingConfig, max_discharge_kw: f64) -> Self {
        Self {
            config,
            max_discharge_kw,
            shaving: false,
        }
    }

    pub fn update_config(&mut self, demand_limit_kw: f64, trigger_percent: f64) {
        self.config.demand_limit_kw = demand_limit_kw;
        self.config.trigger_percent = trigger_percent;
    }

    fn trigger_kw(&self) -> f64 {
        self.config.demand_limit_kw * self.config.trigger_percent / 100.0
    }

    pub fn decide(
        &mut self,
        current_demand_kw: f64,
        soc: f64,
        max_battery_power_kw: f64,
    ) -> ControllerDecision {
        let trigger = self.trigger_kw();
        let release = trigger * RELEASE_FRACTION;

        if soc <= self.config.min_soc_percent {
            self.shaving = false;
            return ControllerDecision::idle(format!(
                "peak shaving unavailable: soc {soc:.1}% too low (min {:.1}%)",
                self.config.min_soc_percent
            ));
        }

        // Engage at the trigger level (inclusive).
        if current_demand_kw >= trigger {
            self.shaving = true;
        } else if self.shaving && current_demand_kw < release {
            self.shaving = false;
        }

        if self.shaving {
            let excess = (current_demand_kw - trigger).max(0.0);
            let power = excess.min(self.max_discharge_kw).min(max_battery_power_kw);
            return ControllerDecision::discharge(
                power,
                format!(
                    "peak shaving: demand {current_demand_kw:.1} kW vs trigger {trigger:.1} kW"
                ),
            );
        }

        ControllerDecision::idle(format!(
            "demand {current_demand_kw:.1} kW below trigger {trigger:.1} kW"
        ))
    }
}
