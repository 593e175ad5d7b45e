//! LIFO4 Edge - BESS Edge Controller
//!
//! Locally manages a Battery Energy Storage System: reads telemetry from
//! the BMS/PCS over the field bus, enforces safety on every cycle, decides
//! charge/discharge setpoints, and exchanges state with the cloud
//! coordinator, continuing to operate when the cloud is unreachable.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        LIFO4 EDGE CONTROLLER                         │
//! │                                                                      │
//! │   ┌──────────────┐      ┌───────────────────────────────────────┐   │
//! │   │  CLOUD LINK  │◄────►│  MQTT CLIENT (QoS-1, last-will,       │   │
//! │   │  (broker)    │      │  backoff reconnect, topic router)     │   │
//! │   └──────────────┘      └───────────┬───────────────────────────┘   │
//! │                  commands / config  │  telemetry / decisions /       │
//! │                  / ota notices      │  alarms / heartbeat            │
//! │   ┌─────────────────────────────────▼───────────────────────────┐   │
//! │   │                     CONTROL LOOP (1 s tick)                  │   │
//! │   │  read → SAFETY → decide → command → persist → sync → sleep  │   │
//! │   └───┬───────────────┬──────────────┬───────────────┬──────────┘   │
//! │       │               │              │               │              │
//! │   ┌───▼────┐   ┌──────▼─────┐  ┌─────▼──────┐  ┌─────▼─────┐       │
//! │   │ FIELD  │   │   SAFETY   │  │  DECISION  │  │   LOCAL   │       │
//! │   │  BUS   │   │  MANAGER   │  │   ENGINE   │  │   STORE   │       │
//! │   │(Modbus)│   │(thresholds)│  │(priorities)│  │ (SQLite)  │       │
//! │   └────────┘   └────────────┘  └────────────┘  └───────────┘       │
//! │                                                                      │
//! │   Self-Healing ── watchdog, retries, resource pressure               │
//! │   Provisioning ── zero-touch bootstrap, discovery                    │
//! │   OTA ─────────── A/B partitions, signed images, auto-rollback       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod alarm;
pub mod cache;
pub mod config;
pub mod control;
pub mod controllers;
pub mod engine;
pub mod fieldbus;
pub mod healing;
pub mod identity;
pub mod metrics;
pub mod mqtt;
pub mod ota;
pub mod provisioning;
pub mod safety;
pub mod store;
pub mod sync;

use thiserror::Error;

pub use config::{EdgeConfig, EdgePaths};
pub use control::ControlLoop;
pub use engine::{Decision, DecisionEngine, OperatingMode};
pub use fieldbus::{FieldBus, ModbusFieldBus, TelemetrySnapshot};
pub use safety::{SafetyManager, SafetyVerdict};
pub use store::Store;

/// Edge error types
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("field bus error: {0}")]
    FieldBus(#[from] fieldbus::FieldBusError),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("messaging error: {0}")]
    Mqtt(#[from] mqtt::MqttError),
    #[error("ota error: {0}")]
    Ota(#[from] ota::OtaError),
    #[error("provisioning error: {0}")]
    Provisioning(#[from] provisioning::ProvisioningError),
    #[error("config error: {0}")]
    Config(String),
}
