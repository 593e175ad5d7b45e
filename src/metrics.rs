//! Metrics
//!
//! In-process gauges and counters for the control loop, exported in
//! Prometheus text format for scraping by whatever transport the site
//! provides (no HTTP listener on the edge).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Metrics collector
#[derive(Default)]
pub struct MetricsCollector {
    inner: Arc<RwLock<EdgeMetrics>>,
}

/// Snapshot of every exported series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeMetrics {
    pub battery_soc_percent: f64,
    pub battery_power_kw: f64,
    pub battery_temp_max_c: f64,
    pub control_loop_duration_ms: f64,
    pub control_loop_cycles_total: u64,
    pub loop_overruns_total: u64,
    pub safety_violations_total: u64,
    pub decisions_total: u64,
    pub alarms_published_total: u64,
    pub queue_depth: u64,
    pub mqtt_connected: bool,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, duration_ms: f64) {
        let mut m = self.inner.write();
        m.control_loop_cycles_total += 1;
        m.control_loop_duration_ms = duration_ms;
    }

    pub fn record_telemetry(&self, soc: f64, power_kw: f64, temp_max: f64) {
        let mut m = self.inner.write();
        m.battery_soc_percent = soc;
        m.battery_power_kw = power_kw;
        m.battery_temp_max_c = temp_max;
    }

    pub fn record_safety_violation(&self) {
        self.inner.write().safety_violations_total += 1;
    }

    pub fn record_decision(&self) {
        self.inner.write().decisions_total += 1;
    }

    pub fn record_alarm(&self) {
        self.inner.write().alarms_published_total += 1;
    }

    pub fn record_overrun(&self) {
        self.inner.write().loop_overruns_total += 1;
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.inner.write().queue_depth = depth;
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.inner.write().mqtt_connected = connected;
    }

    pub fn collect(&self) -> EdgeMetrics {
        self.inner.read().clone()
    }

    /// Export as Prometheus format
    pub fn prometheus(&self) -> String {
        let m = self.collect();
        let mut output = String::new();
        output.push_str("# HELP edge_battery_soc_percent Battery state of charge\n");
        output.push_str(&format!("edge_battery_soc_percent {}\n", m.battery_soc_percent));
        output.push_str("# HELP edge_battery_power_kw Signed battery power\n");
        output.push_str(&format!("edge_battery_power_kw {}\n", m.battery_power_kw));
        output.push_str(&format!("edge_battery_temp_max_c {}\n", m.battery_temp_max_c));
        output.push_str(&format!(
            "edge_control_loop_duration_ms {}\n",
            m.control_loop_duration_ms
        ));
        output.push_str(&format!(
            "edge_control_loop_cycles_total {}\n",
            m.control_loop_cycles_total
        ));
        output.push_str(&format!("edge_loop_overruns_total {}\n", m.loop_overruns_total));
        output.push_str(&format!(
            "edge_safety_violations_total {}\n",
            m.safety_violations_total
        ));
        output.push_str(&format!("edge_decisions_total {}\n", m.decisions_total));
        output.push_str(&format!(
            "edge_alarms_published_total {}\n",
            m.alarms_published_total
        ));
        output.push_str(&format!("edge_queue_depth {}\n", m.queue_depth));
        output.push_str(&format!(
            "edge_mqtt_connected {}\n",
            if m.mqtt_connected { 1 } else { 0 }
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_cycle(12.5);
        metrics.record_cycle(8.0);
        metrics.record_safety_violation();

        let m = metrics.collect();
        assert_eq!(m.control_loop_cycles_total, 2);
        assert_eq!(m.control_loop_duration_ms, 8.0);
        assert_eq!(m.safety_violations_total, 1);
    }

    #[test]
    fn test_prometheus_export_contains_series() {
        let metrics = MetricsCollector::new();
        metrics.record_telemetry(55.0, -20.0, 31.5);
        let text = metrics.prometheus();
        assert!(text.contains("edge_battery_soc_percent 55"));
        assert!(text.contains("edge_battery_power_kw -20"));
        assert!(text.contains("edge_mqtt_connected 0"));
    }
}
