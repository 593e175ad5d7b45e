//! Black start / grid-code response
//!
//! A small state machine driven by grid voltage and frequency. Its output
//! is promoted to GRID_CODE priority by the engine: whenever the state is
//! anything but `GridConnected`, grid response overrides every economic
//! strategy.

use serde::{Deserialize, Serialize};

/// Grid connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GridState {
    GridConnected,
    GridFailureDetected,
    Transferring,
    IslandMode,
    Reconnecting,
    Synchronizing,
}

/// Cycles of healthy grid required to leave `Synchronizing`.
const SYNC_STABLE_CYCLES: u32 = 3;

pub struct BlackStartController {
    state: GridState,
    nominal_voltage: f64,
    nominal_frequency: f64,
    stable_cycles: u32,
}

impl BlackStartController {
    pub fn new(nominal_voltage: f64, nominal_frequency: f64) -> Self {
        Self {
            state: GridState::GridConnected,
            nominal_voltage,
            nominal_frequency,
            stable_cycles: 0,
        }
    }

    pub fn state(&self) -> GridState {
        self.state
    }

    pub fn is_islanded(&self) -> bool {
        self.state == GridState::IslandMode
    }

    fn grid_healthy(&self, frequency: f64, grid_voltage: f64) -> bool {
        let voltage_ok = grid_voltage >= self.nominal_voltage * 0.8
            && grid_voltage <= self.nominal_voltage * 1.15;
        let frequency_ok = (frequency - self.nominal_frequency).abs() <= 2.5;
        voltage_ok && frequency_ok
    }

    /// Advance the machine one cycle and return the new state.
    pub fn process(&mut self, frequency: f64, grid_voltage: f64) -> GridState {
        let healthy = self.grid_healthy(frequency, grid_voltage);
        let previous = self.state;

        self.state = match self.state {
            GridState::GridConnected => {
                if healthy {
                    GridState::GridConnected
                } else {
                    GridState::GridFailureDetected
                }
            }
            GridState::GridFailureDetected => {
                if healthy {
                    GridState::GridConnected
                } else {
                    GridState::Transferring
                }
            }
            GridState::Transferring => GridState::IslandMode,
            GridState::IslandMode => {
                if healthy {
                    GridState::Reconnecting
                } else {
                    GridState::IslandMode
                }
            }
            GridState::Reconnecting => {
                if healthy {
                    self.stable_cycles = 0;
                    GridState::Synchronizing
                } else {
                    GridState::IslandMode
                }
            }
            GridState::Synchronizing => {
                if healthy {
                    self.stable_cycles += 1;
                    if self.stable_cycles >= SYNC_STABLE_CYCLES {
                        GridState::GridConnected
                    } else {
                        GridState::Synchronizing
                    }
                } else {
                    self.stable_cycles = 0;
                    GridState::IslandMode
                }
            }
        };

        if self.state != previous {
            tracing::warn!(
                "grid state {} -> {}",
                state_name(previous),
                state_name(self.state)
            );
        }
        self.state
    }
}

fn state_name(state: GridState) -> &'static str {
    match state {
        GridState::GridConnected => "GRID_CONNECTED",
        GridState::GridFailureDetected => "GRID_FAILURE_DETECTED",
        GridState::Transferring => "TRANSFERRING",
        GridState::IslandMode => "ISLAND_MODE",
        GridState::Reconnecting => "RECONNECTING",
        GridState::Synchronizing => "SYNCHRONIZING",
    }
}
