//! Sub-controllers
//!
//! Independent policy modules composed by the decision engine. Each one
//! maps (snapshot readings + cached inputs) to a proposed action; the only
//! internal state allowed is a small machine (peak-shaving's hysteresis
//! latch, black-start's grid state).

pub mod arbitrage;
pub mod black_start;
pub mod peak_shaving;
pub mod solar;

pub use arbitrage::ArbitrageController;
pub use black_start::{BlackStartController, GridState};
pub use peak_shaving::PeakShavingController;
pub use solar::SolarSelfConsumptionController;

use crate::engine::DecisionAction;

/// A sub-controller's proposal, before arbitration.
#[derive(Debug, Clone)]
pub struct ControllerDecision {
    pub action: DecisionAction,
    pub power_kw: f64,
    pub reason: String,
}

impl ControllerDecision {
    pub fn idle(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Idle,
            power_kw: 0.0,
            reason: reason.into(),
        }
    }

    pub fn charge(power_kw: f64, reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Charge,
            power_kw,
            reason: reason.into(),
        }
    }

    pub fn discharge(power_kw: f64, reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Discharge,
            power_kw,
            reason: reason.into(),
        }
    }

    /// True when this proposal asks the battery to move power.
    pub fn is_active(&self) -> bool {
        matches!(self.action, DecisionAction::Charge | DecisionAction::Discharge)
    }
}
