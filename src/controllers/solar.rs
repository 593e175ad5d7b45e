//! Solar self-consumption
//!
//! Store the surplus when generation exceeds load, optionally feed the
//! loads back overnight.

use super::ControllerDecision;
use crate::config::SolarConfig;

/// SOC floor for optional night discharge.
const NIGHT_DISCHARGE_MIN_SOC: f64 = 30.0;

pub struct SolarSelfConsumptionController {
    config: SolarConfig,
    max_charge_kw: f64,
    max_discharge_kw: f64,
}

impl SolarSelfConsumptionController {
    pub fn new(config: SolarConfig, max_charge_kw: f64, max_discharge_kw: f64) -> Self {
        Self {
            config,
            max_charge_kw,
            max_discharge_kw,
        }
    }

    pub fn update_config(&mut self, config: SolarConfig) {
        self.config = config;
    }

    pub fn decide(
        &self,
        soc: f64,
        solar_generation_kw: f64,
        load_kw: f64,
        max_battery_power_kw: f64,
    ) -> ControllerDecision {
        let surplus = solar_generation_kw - load_kw;

        if surplus > self.config.min_solar_excess_kw && soc < self.config.target_soc {
            let power = surplus.min(self.max_charge_kw).min(max_battery_power_kw);
            return ControllerDecision::charge(
                power,
                format!("solar surplus {surplus:.1} kW, soc {soc:.1}% below target"),
            );
        }

        // At night the panels are dark; optionally serve the loads.
        if self.config.night_discharge
            && solar_generation_kw <= 0.1
            && load_kw > 0.0
            && soc > NIGHT_DISCHARGE_MIN_SOC
        {
            let power = load_kw.min(self.max_discharge_kw).min(max_battery_power_kw);
            return ControllerDecision::discharge(
                power,
                format!("night discharge toward {load_kw:.1} kW load"),
            );
        }

        ControllerDecision::idle("no usable solar surplus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DecisionAction;

    #[test]
    fn test_surplus_charges() {
        let ctrl = SolarSelfConsumptionController::new(SolarConfig::default(), 50.0, 50.0);
        let decision = ctrl.decide(50.0, 30.0, 10.0, 50.0);
        assert_eq!(decision.action, DecisionAction::Charge);
        assert_eq!(decision.power_kw, 20.0);
    }

    #[test]
    fn test_full_battery_ignores_surplus() {
        let ctrl = SolarSelfConsumptionController::new(SolarConfig::default(), 50.0, 50.0);
        let decision = ctrl.decide(95.0, 30.0, 10.0, 50.0);
        assert_eq!(decision.action, DecisionAction::Idle);
    }

    #[test]
    fn test_small_surplus_ignored() {
        let ctrl = SolarSelfConsumptionController::new(SolarConfig::default(), 50.0, 50.0);
        let decision = ctrl.decide(50.0, 10.3, 10.0, 50.0);
        assert_eq!(decision.action, DecisionAction::Idle);
    }

    #[test]
    fn test_night_discharge_when_enabled() {
        let config = SolarConfig {
            night_discharge: true,
            ..SolarConfig::default()
        };
        let ctrl = SolarSelfConsumptionController::new(config, 50.0, 50.0);
        let decision = ctrl.decide(60.0, 0.0, 15.0, 50.0);
        assert_eq!(decision.action, DecisionAction::Discharge);
        assert_eq!(decision.power_kw, 15.0);
    }

    #[test]
    fn test_night_discharge_respects_soc_floor() {
        let config = SolarConfig {
            night_discharge: true,
            ..SolarConfig::default()
        };
        let ctrl = SolarSelfConsumptionController::new(config, 50.0, 50.0);
        let decision = ctrl.decide(25.0, 0.0, 15.0, 50.0);
        assert_eq!(decision.action, DecisionAction::Idle);
    }
}
