//! Alarms and severity scale
//!
//! Alarms originate from the Safety Manager, the Self-Healing Manager, or
//! cloud commands. Every alarm carries a stable machine-readable `kind` plus
//! a human-readable message; flapping sources are de-duplicated through a
//! per-kind cooldown before anything reaches the operator.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Severity scale shared by safety verdicts and alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Advisory,
    Warning,
    Alarm,
    Critical,
    Emergency,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Advisory => "ADVISORY",
            Severity::Warning => "WARNING",
            Severity::Alarm => "ALARM",
            Severity::Critical => "CRITICAL",
            Severity::Emergency => "EMERGENCY",
        }
    }
}

/// Stable alarm kinds. Kinds are part of the operator contract: dashboards
/// and runbooks key off them, so they never change spelling.
pub mod kinds {
    pub const SAFETY_EMERGENCY_STOP: &str = "SAFETY_EMERGENCY_STOP";
    pub const SAFETY_STOP_CHARGE: &str = "SAFETY_STOP_CHARGE";
    pub const SAFETY_STOP_DISCHARGE: &str = "SAFETY_STOP_DISCHARGE";
    pub const SAFETY_STOP_ALL: &str = "SAFETY_STOP_ALL";
    pub const SAFETY_REDUCE_POWER: &str = "SAFETY_REDUCE_POWER";
    pub const SAFETY_WARNING: &str = "SAFETY_WARNING";
    pub const SAFE_MODE_ENTERED: &str = "SAFE_MODE_ENTERED";
    pub const SAFE_MODE_EXITED: &str = "SAFE_MODE_EXITED";
    pub const FIELD_BUS_EXHAUSTED: &str = "FIELD_BUS_EXHAUSTED";
    pub const LOOP_OVERRUN: &str = "LOOP_OVERRUN";
    pub const DISK_CRITICAL: &str = "DISK_CRITICAL";
    pub const MEMORY_CRITICAL: &str = "MEMORY_CRITICAL";
    pub const WATCHDOG_TIMEOUT: &str = "WATCHDOG_TIMEOUT";
    pub const CONTROL_LOOP_RESTART_FAILED: &str = "CONTROL_LOOP_RESTART_FAILED";
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
    pub const OTA_CHECKSUM_FAILED: &str = "OTA_CHECKSUM_FAILED";
    pub const OTA_SIGNATURE_FAILED: &str = "OTA_SIGNATURE_FAILED";
    pub const STORE_WRITE_FAILED: &str = "STORE_WRITE_FAILED";
}

/// A single alarm event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub raised_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl Alarm {
    pub fn new(severity: Severity, kind: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind: kind.to_string(),
            message: message.into(),
            metadata: serde_json::Value::Null,
            raised_at: Utc::now(),
            acknowledged: false,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Per-kind publish cooldown so a flapping source produces one operator
/// message per window instead of one per cycle.
pub struct AlarmDebouncer {
    cooldown: Duration,
    last_published: Mutex<HashMap<String, Instant>>,
}

impl AlarmDebouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_published: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if this kind may be published now, and records the
    /// publish time. A suppressed alarm is still persisted by the caller.
    pub fn should_publish(&self, kind: &str) -> bool {
        let mut last = self.last_published.lock();
        let now = Instant::now();
        match last.get(kind) {
            Some(t) if now.duration_since(*t) < self.cooldown => false,
            _ => {
                last.insert(kind.to_string(), now);
                true
            }
        }
    }
}

impl Default for AlarmDebouncer {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Emergency > Severity::Critical);
        assert!(Severity::Critical > Severity::Alarm);
        assert!(Severity::Alarm > Severity::Warning);
        assert!(Severity::Warning > Severity::Advisory);
    }

    #[test]
    fn test_debouncer_suppresses_repeats() {
        let debouncer = AlarmDebouncer::new(Duration::from_secs(60));
        assert!(debouncer.should_publish(kinds::LOOP_OVERRUN));
        assert!(!debouncer.should_publish(kinds::LOOP_OVERRUN));
        // A different kind is independent
        assert!(debouncer.should_publish(kinds::DISK_CRITICAL));
    }

    #[test]
    fn test_debouncer_allows_after_cooldown() {
        let debouncer = AlarmDebouncer::new(Duration::from_millis(0));
        assert!(debouncer.should_publish("X"));
        assert!(debouncer.should_publish("X"));
    }

    #[test]
    fn test_alarm_serializes_severity_screaming() {
        let alarm = Alarm::new(Severity::Critical, kinds::DISK_CRITICAL, "disk at 91%");
        let json = serde_json::to_value(&alarm).unwrap();
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(json["kind"], "DISK_CRITICAL");
    }
}
