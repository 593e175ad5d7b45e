//! Safety Manager
//!
//! A pure evaluator: a telemetry snapshot plus the configured threshold
//! table maps to exactly one verdict, with no hidden inputs. The control
//! loop calls this before any optimization on every cycle and honors the
//! verdict's action in the same cycle, without exception.
//!
//! Hysteresis keeps verdicts from flapping: once a bound is crossed, the
//! reading must clear it by at least the entry's `hysteresis` margin before
//! the severity drops again.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::alarm::Severity;
use crate::fieldbus::TelemetrySnapshot;

/// Protective actions, ordered roughly by how much they shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyAction {
    None,
    ReducePower,
    StopCharge,
    StopDischarge,
    StopAll,
    EmergencyStop,
}

impl SafetyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyAction::None => "NONE",
            SafetyAction::ReducePower => "REDUCE_POWER",
            SafetyAction::StopCharge => "STOP_CHARGE",
            SafetyAction::StopDischarge => "STOP_DISCHARGE",
            SafetyAction::StopAll => "STOP_ALL",
            SafetyAction::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

/// Outcome of one safety evaluation.
///
/// Invariant: `ok` ⇔ `action == None` ∧ `severity == Advisory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub ok: bool,
    pub severity: Severity,
    pub action: SafetyAction,
    pub parameter: String,
    pub value: f64,
    pub limit: f64,
    pub reason: String,
}

impl SafetyVerdict {
    pub fn all_clear() -> Self {
        Self {
            ok: true,
            severity: Severity::Advisory,
            action: SafetyAction::None,
            parameter: String::new(),
            value: 0.0,
            limit: 0.0,
            reason: "all parameters within limits".into(),
        }
    }
}

/// One row of the threshold table. Bounds are optional per side, so a
/// single-sided protection (e.g. `soc_high`) is just a row with only high
/// bounds set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub parameter: String,
    pub zone: String,
    pub warning_low: Option<f64>,
    pub warning_high: Option<f64>,
    pub alarm_low: Option<f64>,
    pub alarm_high: Option<f64>,
    pub critical_low: Option<f64>,
    pub critical_high: Option<f64>,
    pub action_warning: SafetyAction,
    pub action_alarm: SafetyAction,
    pub action_critical: SafetyAction,
    pub hysteresis: f64,
}

/// Compiled-in defaults covering the full protection set. Sites may replace
/// the table wholesale via the provisioned `safety_limits`.
pub fn default_thresholds() -> Vec<Threshold> {
    vec![
        Threshold {
            parameter: "cell_voltage".into(),
            zone: "cell".into(),
            warning_low: Some(2.8),
            warning_high: Some(3.55),
            alarm_low: Some(2.6),
            alarm_high: Some(3.6),
            critical_low: Some(2.5),
            critical_high: Some(3.65),
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::ReducePower,
            action_critical: SafetyAction::EmergencyStop,
            hysteresis: 0.02,
        },
        Threshold {
            parameter: "cell_temperature".into(),
            zone: "cell".into(),
            warning_low: Some(5.0),
            warning_high: Some(45.0),
            alarm_low: Some(0.0),
            alarm_high: Some(50.0),
            critical_low: Some(-10.0),
            critical_high: Some(60.0),
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::ReducePower,
            action_critical: SafetyAction::EmergencyStop,
            hysteresis: 2.0,
        },
        Threshold {
            parameter: "pack_current".into(),
            zone: "pack".into(),
            warning_low: None,
            warning_high: Some(450.0),
            alarm_low: None,
            alarm_high: Some(480.0),
            critical_low: None,
            critical_high: Some(500.0),
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::ReducePower,
            action_critical: SafetyAction::EmergencyStop,
            hysteresis: 5.0,
        },
        Threshold {
            parameter: "insulation_resistance".into(),
            zone: "pack".into(),
            warning_low: Some(500.0),
            warning_high: None,
            alarm_low: Some(100.0),
            alarm_high: None,
            critical_low: Some(50.0),
            critical_high: None,
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::ReducePower,
            action_critical: SafetyAction::EmergencyStop,
            hysteresis: 10.0,
        },
        Threshold {
            parameter: "smoke_level".into(),
            zone: "enclosure".into(),
            warning_low: None,
            warning_high: Some(0.1),
            alarm_low: None,
            alarm_high: Some(0.3),
            critical_low: None,
            critical_high: Some(0.5),
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::EmergencyStop,
            action_critical: SafetyAction::EmergencyStop,
            hysteresis: 0.05,
        },
        Threshold {
            parameter: "gas_ppm".into(),
            zone: "enclosure".into(),
            warning_low: None,
            warning_high: Some(50.0),
            alarm_low: None,
            alarm_high: Some(100.0),
            critical_low: None,
            critical_high: Some(200.0),
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::EmergencyStop,
            action_critical: SafetyAction::EmergencyStop,
            hysteresis: 5.0,
        },
        // SOC protection is two single-sided rows so that low-side and
        // high-side breaches carry distinct directional actions.
        Threshold {
            parameter: "soc_low".into(),
            zone: "pack".into(),
            warning_low: Some(10.0),
            warning_high: None,
            alarm_low: Some(5.0),
            alarm_high: None,
            critical_low: Some(2.0),
            critical_high: None,
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::StopDischarge,
            action_critical: SafetyAction::StopAll,
            hysteresis: 1.0,
        },
        Threshold {
            parameter: "soc_high".into(),
            zone: "pack".into(),
            warning_low: None,
            warning_high: Some(95.0),
            alarm_low: None,
            alarm_high: Some(98.0),
            critical_low: None,
            critical_high: Some(100.0),
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::StopCharge,
            action_critical: SafetyAction::StopAll,
            hysteresis: 1.0,
        },
        Threshold {
            parameter: "watchdog_heartbeat_age".into(),
            zone: "controller".into(),
            warning_low: None,
            warning_high: Some(15.0),
            alarm_low: None,
            alarm_high: Some(30.0),
            critical_low: None,
            critical_high: Some(60.0),
            action_warning: SafetyAction::None,
            action_alarm: SafetyAction::StopAll,
            action_critical: SafetyAction::EmergencyStop,
            hysteresis: 0.0,
        },
    ]
}

/// Which zone a breach landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Ok,
    Warning,
    Alarm,
    Critical,
}

struct Latch {
    level: Level,
    high_side: bool,
    bound: f64,
}

/// Safety manager: threshold table plus the hysteresis latches.
pub struct SafetyManager {
    thresholds: Vec<Threshold>,
    latches: Mutex<HashMap<String, Latch>>,
}

impl SafetyManager {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        Self {
            thresholds,
            latches: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_thresholds())
    }

    /// Evaluate every parameter in fixed table order and return the
    /// highest-severity verdict. `heartbeat_age` feeds the watchdog row.
    pub fn check(&self, snapshot: &TelemetrySnapshot, heartbeat_age: Duration) -> SafetyVerdict {
        let mut worst: Option<SafetyVerdict> = None;

        for entry in &self.thresholds {
            for (label, value) in samples_for(entry, snapshot, heartbeat_age) {
                let verdict = self.evaluate_sample(entry, &label, value);
                if let Some(verdict) = verdict {
                    let replace = match &worst {
                        Some(current) => verdict.severity > current.severity,
                        None => true,
                    };
                    if replace {
                        worst = Some(verdict);
                    }
                }
            }
        }

        worst.unwrap_or_else(SafetyVerdict::all_clear)
    }

    fn evaluate_sample(&self, entry: &Threshold, label: &str, value: f64) -> Option<SafetyVerdict> {
        let (mut level, mut high_side, mut bound) = classify(entry, value);

        // Hysteresis: a lower raw level only sticks once the reading has
        // cleared the latched bound by the configured margin.
        let key = format!("{}:{}", entry.parameter, label);
        {
            let mut latches = self.latches.lock();
            match latches.get(&key) {
                Some(latch) if level < latch.level => {
                    let cleared = if latch.high_side {
                        value <= latch.bound - entry.hysteresis
                    } else {
                        value >= latch.bound + entry.hysteresis
                    };
                    if cleared {
                        latches.insert(key, Latch { level, high_side, bound });
                    } else {
                        level = latch.level;
                        high_side = latch.high_side;
                        bound = latch.bound;
                    }
                }
                _ => {
                    latches.insert(key, Latch { level, high_side, bound });
                }
            }
        }

        if level == Level::Ok {
            return None;
        }

        let action = match level {
            Level::Warning => entry.action_warning,
            Level::Alarm => entry.action_alarm,
            Level::Critical => entry.action_critical,
            Level::Ok => SafetyAction::None,
        };
        let mut severity = match level {
            Level::Warning => Severity::Warning,
            Level::Alarm => Severity::Alarm,
            Level::Critical => Severity::Critical,
            Level::Ok => Severity::Advisory,
        };
        if action == SafetyAction::EmergencyStop {
            severity = Severity::Emergency;
        }

        let direction = if high_side { "above" } else { "below" };
        Some(SafetyVerdict {
            ok: false,
            severity,
            action,
            parameter: label.to_string(),
            value,
            limit: bound,
            reason: format!(
                "{label} {value:.3} {direction} {} limit {bound:.3}",
                severity.as_str().to_lowercase()
            ),
        })
    }
}

/// Classify one reading against an entry's bounds. Returns the zone, which
/// side was crossed, and the bound that was crossed.
fn classify(entry: &Threshold, value: f64) -> (Level, bool, f64) {
    if let Some(bound) = entry.critical_high {
        if value > bound {
            return (Level::Critical, true, bound);
        }
    }
    if let Some(bound) = entry.critical_low {
        if value < bound {
            return (Level::Critical, false, bound);
        }
    }
    if let Some(bound) = entry.alarm_high {
        if value > bound {
            return (Level::Alarm, true, bound);
        }
    }
    if let Some(bound) = entry.alarm_low {
        if value < bound {
            return (Level::Alarm, false, bound);
        }
    }
    if let Some(bound) = entry.warning_high {
        if value > bound {
            return (Level::Warning, true, bound);
        }
    }
    if let Some(bound) = entry.warning_low {
        if value < bound {
            return (Level::Warning, false, bound);
        }
    }
    (Level::Ok, false, 0.0)
}

/// Map a table row to the snapshot readings it covers. Optional sensor
/// channels yield nothing when the hardware does not report them.
fn samples_for(
    entry: &Threshold,
    snapshot: &TelemetrySnapshot,
    heartbeat_age: Duration,
) -> Vec<(String, f64)> {
    match entry.parameter.as_str() {
        "cell_voltage" => vec![
            ("cell_voltage_min".into(), snapshot.cell_voltage_min),
            ("cell_voltage_max".into(), snapshot.cell_voltage_max),
        ],
        "cell_temperature" => vec![
            ("temp_min".into(), snapshot.temp_min),
            ("temp_max".into(), snapshot.temp_max),
        ],
        "pack_current" => vec![("pack_current".into(), snapshot.current.abs())],
        "insulation_resistance" => snapshot
            .insulation_resistance_kohm
            .map(|v| vec![("insulation_resistance".into(), v)])
            .unwrap_or_default(),
        "smoke_level" => snapshot
            .smoke_level
            .map(|v| vec![("smoke_level".into(), v)])
            .unwrap_or_default(),
        "gas_ppm" => snapshot
            .gas_ppm
            .map(|v| vec![("gas_ppm".into(), v)])
            .unwrap_or_default(),
        "soc_low" | "soc_high" => vec![(entry.parameter.clone(), snapshot.soc)],
        "watchdog_heartbeat_age" => vec![(
            "watchdog_heartbeat_age".into(),
            heartbeat_age.as_secs_f64(),
        )],
        other => {
            tracing::debug!("threshold for unknown parameter '{}' skipped", other);
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Instant;

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            soc: 50.0,
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

    const NO_AGE: Duration = Duration::from_secs(1);

    #[test]
    fn test_nominal_snapshot_is_ok() {
        let safety = SafetyManager::with_defaults();
        let verdict = safety.check(&snapshot(), NO_AGE);
        assert!(verdict.ok);
        assert_eq!(verdict.action, SafetyAction::None);
        assert_eq!(verdict.severity, Severity::Advisory);
    }

    #[test]
    fn test_over_temperature_emergency_stop() {
        let safety = SafetyManager::with_defaults();
        let mut s = snapshot();
        s.temp_max = 62.0; // above critical_high = 60
        let verdict = safety.check(&s, NO_AGE);
        assert!(!verdict.ok);
        assert_eq!(verdict.action, SafetyAction::EmergencyStop);
        assert_eq!(verdict.severity, Severity::Emergency);
        assert_eq!(verdict.parameter, "temp_max");
        assert_eq!(verdict.limit, 60.0);
    }

    #[test]
    fn test_cell_voltage_alarm_reduces_power() {
        let safety = SafetyManager::with_defaults();
        let mut s = snapshot();
        s.cell_voltage_max = 3.62; // above alarm_high = 3.6, below critical
        let verdict = safety.check(&s, NO_AGE);
        assert_eq!(verdict.action, SafetyAction::ReducePower);
        assert_eq!(verdict.severity, Severity::Alarm);
    }

    #[test]
    fn test_highest_severity_wins() {
        let safety = SafetyManager::with_defaults();
        let mut s = snapshot();
        s.cell_voltage_max = 3.62; // alarm
        s.temp_max = 62.0; // emergency
        let verdict = safety.check(&s, NO_AGE);
        assert_eq!(verdict.severity, Severity::Emergency);
        assert_eq!(verdict.parameter, "temp_max");
    }

    #[test]
    fn test_soc_directional_actions() {
        let safety = SafetyManager::with_defaults();
        let mut s = snapshot();
        s.soc = 4.0; // below alarm_low = 5
        let verdict = safety.check(&s, NO_AGE);
        assert_eq!(verdict.action, SafetyAction::StopDischarge);

        let safety = SafetyManager::with_defaults();
        let mut s = snapshot();
        s.soc = 98.5; // above alarm_high = 98
        let verdict = safety.check(&s, NO_AGE);
        assert_eq!(verdict.action, SafetyAction::StopCharge);
    }

    #[test]
    fn test_watchdog_age_trips_stop_all() {
        let safety = SafetyManager::with_defaults();
        let verdict = safety.check(&snapshot(), Duration::from_secs(35));
        assert_eq!(verdict.action, SafetyAction::StopAll);
        assert_eq!(verdict.parameter, "watchdog_heartbeat_age");
    }

    #[test]
    fn test_hysteresis_holds_severity() {
        let safety = SafetyManager::with_defaults();
        let mut s = snapshot();

        s.temp_max = 46.0; // above warning_high = 45
        assert_eq!(safety.check(&s, NO_AGE).severity, Severity::Warning);

        // Back under the bound but within the 2° hysteresis band
        s.temp_max = 44.5;
        assert_eq!(safety.check(&s, NO_AGE).severity, Severity::Warning);

        // Cleared by more than the margin
        s.temp_max = 42.9;
        assert!(safety.check(&s, NO_AGE).ok);
    }

    #[test]
    fn test_evaluation_is_stable_for_same_input() {
        let safety = SafetyManager::with_defaults();
        let mut s = snapshot();
        s.cell_voltage_max = 3.62;
        let first = safety.check(&s, NO_AGE);
        let second = safety.check(&s, NO_AGE);
        assert_eq!(first, second);
    }

    #[test]
    fn test_optional_sensors_skipped_when_absent() {
        let safety = SafetyManager::with_defaults();
        let mut s = snapshot();
        s.smoke_level = Some(0.4); // above alarm_high = 0.3
        assert_eq!(safety.check(&s, NO_AGE).action, SafetyAction::EmergencyStop);

        let mut s2 = snapshot();
        s2.smoke_level = None;
        assert!(SafetyManager::with_defaults().check(&s2, NO_AGE).ok);
    }
}
