//! Energy arbitrage
//!
//! Charge when the tariff is cheap, discharge when it is expensive. SOC
//! guards use strict inequalities: at exactly `min_soc_for_sell` the sell
//! side stays disabled, at exactly `max_soc_for_buy` the buy side does.

use super::ControllerDecision;
use crate::config::ArbitrageConfig;

pub struct ArbitrageController {
    config: ArbitrageConfig,
    max_charge_power_kw: f64,
    max_discharge_power_kw: f64,
}

impl ArbitrageController {
    pub fn new(config: ArbitrageConfig, max_charge_power_kw: f64, max_discharge_power_kw: f64) -> Self {
        Self {
            config,
            max_charge_power_kw,
            max_discharge_power_kw,
        }
    }

    pub fn update_config(&mut self, config: ArbitrageConfig) {
        self.config = config;
    }

    /// Propose an action for the current hour's price.
    pub fn decide(&self, soc: f64, current_price: f64, max_power_kw: f64) -> ControllerDecision {
        let c = &self.config;

        if current_price <= c.buy_threshold_price && soc < c.max_soc_for_buy {
            let power = self.max_charge_power_kw.min(max_power_kw);
            return ControllerDecision::charge(
                power,
                format!(
                    "arbitrage buy: price {current_price:.2} <= {:.2}, soc {soc:.1}%",
                    c.buy_threshold_price
                ),
            );
        }

        if current_price >= c.sell_threshold_price && soc > c.min_soc_for_sell {
            let power = self.max_discharge_power_kw.min(max_power_kw);
            return ControllerDecision::discharge(
                power,
                format!(
                    "arbitrage sell: price {current_price:.2} >= {:.2}, soc {soc:.1}%",
                    c.sell_threshold_price
                ),
            );
        }

        ControllerDecision::idle(format!("price {current_price:.2} in neutral band"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DecisionAction;

    fn controller() -> ArbitrageController {
        ArbitrageController::new(ArbitrageConfig::default(), 50.0, 50.0)
    }

    #[test]
    fn test_cheap_price_charges() {
        let decision = controller().decide(50.0, 0.30, 50.0);
        assert_eq!(decision.action, DecisionAction::Charge);
        assert!(decision.power_kw > 0.0);
    }

    #[test]
    fn test_expensive_price_discharges() {
        let decision = controller().decide(70.0, 1.20, 50.0);
        assert_eq!(decision.action, DecisionAction::Discharge);
        assert!(decision.power_kw > 0.0);
    }

    #[test]
    fn test_neutral_price_idles() {
        let decision = controller().decide(50.0, 0.65, 50.0);
        assert_eq!(decision.action, DecisionAction::Idle);
        assert_eq!(decision.power_kw, 0.0);
    }

    #[test]
    fn test_high_soc_prevents_charge() {
        let decision = controller().decide(95.0, 0.20, 50.0);
        assert_eq!(decision.action, DecisionAction::Idle);
    }

    #[test]
    fn test_low_soc_prevents_discharge() {
        let decision = controller().decide(25.0, 1.50, 50.0);
        assert_eq!(decision.action, DecisionAction::Idle);
    }

    #[test]
    fn test_sell_disabled_at_exact_min_soc() {
        // Strict inequality: soc == min_soc_for_sell must not discharge
        let decision = controller().decide(30.0, 1.50, 50.0);
        assert_eq!(decision.action, DecisionAction::Idle);
    }

    #[test]
    fn test_buy_disabled_at_exact_max_soc() {
        let decision = controller().decide(90.0, 0.20, 50.0);
        assert_eq!(decision.action, DecisionAction::Idle);
    }
}
