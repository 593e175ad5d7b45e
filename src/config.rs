//! Edge Configuration
//!
//! The provisioned device config lives at `/data/config/device.json` and is
//! replaced atomically. Unknown JSON fields are dropped; a missing required
//! field surfaces as a `CONFIG_INVALID` error at the boundary that parsed it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Edge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Deterministic device identity (set by provisioning)
    #[serde(default)]
    pub edge_id: String,
    /// Site ID (topic namespace)
    pub site_id: String,
    /// System ID assigned by the cloud
    pub system_id: String,
    /// Organization ID
    pub organization_id: String,
    /// Field bus (BMS/PCS) settings
    pub fieldbus: FieldBusConfig,
    /// MQTT broker settings
    pub mqtt: MqttConfig,
    /// Battery nameplate limits
    pub battery: BatteryConfig,
    /// Control loop cadence
    pub control: ControlConfig,
    /// Optimization strategy settings
    pub optimization: OptimizationConfig,
    /// Local data retention
    pub data: DataConfig,
    /// Site-specific safety threshold table; empty means compiled defaults
    #[serde(default)]
    pub safety_limits: Vec<crate::safety::Threshold>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            edge_id: String::new(),
            site_id: String::new(),
            system_id: String::new(),
            organization_id: String::new(),
            fieldbus: FieldBusConfig::default(),
            mqtt: MqttConfig::default(),
            battery: BatteryConfig::default(),
            control: ControlConfig::default(),
            optimization: OptimizationConfig::default(),
            data: DataConfig::default(),
            safety_limits: Vec::new(),
        }
    }
}

impl EdgeConfig {
    /// Load from file
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file, replacing atomically so a crash mid-write never leaves
    /// a truncated config behind.
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), content)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Apply environment overrides (broker endpoint).
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            self.mqtt.broker_host = host;
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT") {
            if let Ok(port) = port.parse() {
                self.mqtt.broker_port = port;
            }
        }
    }
}

/// Field bus connection and register layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldBusConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Per-request deadline; the bus contract caps this at 500 ms
    pub timeout_ms: u64,
    /// Named register map variant (layouts are data, see `fieldbus::RegisterMap`)
    pub register_map: String,
    /// Unit ID range scanned during provisioning discovery
    pub discovery_unit_ids: (u8, u8),
}

impl Default for FieldBusConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.10".into(),
            port: 502,
            unit_id: 1,
            timeout_ms: 500,
            register_map: "default".into(),
            discovery_unit_ids: (1, 10),
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// CA + client certificate directory for the permanent identity
    pub cert_dir: PathBuf,
    /// Publish deadline for QoS-1 traffic
    pub publish_timeout_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "mqtt.lifo4.com.br".into(),
            broker_port: 8883,
            cert_dir: PathBuf::from("/certs/device"),
            publish_timeout_secs: 2,
            keep_alive_secs: 30,
        }
    }
}

/// Battery nameplate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    pub capacity_kwh: f64,
    pub max_charge_power_kw: f64,
    pub max_discharge_power_kw: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 200.0,
            max_charge_power_kw: 50.0,
            max_discharge_power_kw: 50.0,
        }
    }
}

/// Control loop cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub sample_interval_secs: u64,
    pub optimization_interval_secs: u64,
    /// Silence threshold before ONLINE degrades to AUTONOMOUS
    pub cloud_timeout_minutes: u64,
    /// Power cap for decisions emitted in safe mode
    pub safe_mode_cap_kw: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 1,
            optimization_interval_secs: 5,
            cloud_timeout_minutes: 15,
            safe_mode_cap_kw: 10.0,
        }
    }
}

/// Optimization strategy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationConfig {
    pub arbitrage: ArbitrageConfig,
    pub peak_shaving: PeakShavingConfig,
    pub solar: SolarConfig,
    pub safe_mode: SafeModeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageConfig {
    pub buy_threshold_price: f64,
    pub sell_threshold_price: f64,
    pub min_soc_for_sell: f64,
    pub max_soc_for_buy: f64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            buy_threshold_price: 0.45,
            sell_threshold_price: 0.85,
            min_soc_for_sell: 30.0,
            max_soc_for_buy: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakShavingConfig {
    pub demand_limit_kw: f64,
    pub trigger_percent: f64,
    pub min_soc_percent: f64,
    /// Fixed site load added to |battery power| until a meter channel is
    /// wired; see `ControlLoop::estimate_demand_kw`.
    pub demand_base_load_kw: f64,
}

impl Default for PeakShavingConfig {
    fn default() -> Self {
        Self {
            demand_limit_kw: 100.0,
            trigger_percent: 80.0,
            min_soc_percent: 20.0,
            demand_base_load_kw: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolarConfig {
    pub min_solar_excess_kw: f64,
    pub target_soc: f64,
    pub night_discharge: bool,
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self {
            min_solar_excess_kw: 0.5,
            target_soc: 90.0,
            night_discharge: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeModeConfig {
    pub min_soc: f64,
    pub max_soc: f64,
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            min_soc: 20.0,
            max_soc: 80.0,
        }
    }
}

/// Local data retention and queue limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub db_path: PathBuf,
    pub telemetry_retention_hours: i64,
    pub decisions_retention_days: i64,
    pub alarms_retention_days: i64,
    pub queue_retention_days: i64,
    pub cleanup_interval_hours: u64,
    /// Above this queue depth, telemetry is down-sampled before enqueuing
    pub queue_soft_limit: u64,
    /// Keep 1 in K telemetry samples while down-sampling
    pub downsample_keep_1_in: u64,
    /// Disk budget for the store file; usage against it drives retention cuts
    pub max_store_bytes: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/data/edge.db"),
            telemetry_retention_hours: 72,
            decisions_retention_days: 30,
            alarms_retention_days: 90,
            queue_retention_days: 7,
            cleanup_interval_hours: 6,
            queue_soft_limit: 500,
            downsample_keep_1_in: 10,
            max_store_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Well-known filesystem locations. All of them are overridable so tests
/// can point the whole tree into a tempdir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgePaths {
    pub device_config: PathBuf,
    pub active_partition_marker: PathBuf,
    pub version_file: PathBuf,
    pub pending_version: PathBuf,
    pub operational_state: PathBuf,
    pub provisioning_state: PathBuf,
    pub partition_a: PathBuf,
    pub partition_b: PathBuf,
    pub ota_staging: PathBuf,
    pub bootstrap_cert_dir: PathBuf,
    pub device_cert_dir: PathBuf,
    pub signing_public_key: PathBuf,
}

impl Default for EdgePaths {
    fn default() -> Self {
        Self {
            device_config: PathBuf::from("/data/config/device.json"),
            active_partition_marker: PathBuf::from("/data/config/active_partition.txt"),
            version_file: PathBuf::from("/data/config/version.txt"),
            pending_version: PathBuf::from("/data/ota/pending_version.txt"),
            operational_state: PathBuf::from("/data/runtime/operational_state.json"),
            provisioning_state: PathBuf::from("/data/config/provisioning_state.json"),
            partition_a: PathBuf::from("/partition-a"),
            partition_b: PathBuf::from("/partition-b"),
            ota_staging: PathBuf::from("/data/ota/staging"),
            bootstrap_cert_dir: PathBuf::from("/certs/bootstrap"),
            device_cert_dir: PathBuf::from("/certs/device"),
            signing_public_key: PathBuf::from("/certs/device/code-signing.pub"),
        }
    }
}

impl EdgePaths {
    /// Re-root every path under `base` (test fixture helper).
    pub fn under(base: &Path) -> Self {
        let j = |s: &str| base.join(s);
        Self {
            device_config: j("data/config/device.json"),
            active_partition_marker: j("data/config/active_partition.txt"),
            version_file: j("data/config/version.txt"),
            pending_version: j("data/ota/pending_version.txt"),
            operational_state: j("data/runtime/operational_state.json"),
            provisioning_state: j("data/config/provisioning_state.json"),
            partition_a: j("partition-a"),
            partition_b: j("partition-b"),
            ota_staging: j("data/ota/staging"),
            bootstrap_cert_dir: j("certs/bootstrap"),
            device_cert_dir: j("certs/device"),
            signing_public_key: j("certs/device/code-signing.pub"),
        }
    }
}

/// Software version: the OTA-committed marker wins over the build-time env.
pub fn software_version(version_file: &Path) -> String {
    if let Ok(v) = std::fs::read_to_string(version_file) {
        let v = v.trim();
        if !v.is_empty() {
            return v.to_string();
        }
    }
    std::env::var("SOFTWARE_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_operational() {
        let config = EdgeConfig::default();
        assert_eq!(config.control.sample_interval_secs, 1);
        assert_eq!(config.control.optimization_interval_secs, 5);
        assert_eq!(config.control.cloud_timeout_minutes, 15);
        assert_eq!(config.fieldbus.timeout_ms, 500);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        let mut config = EdgeConfig::default();
        config.site_id = "site-042".into();
        config.save(&path).unwrap();

        let loaded = EdgeConfig::load(&path).unwrap();
        assert_eq!(loaded.site_id, "site-042");
        assert_eq!(loaded.battery.max_charge_power_kw, 50.0);
    }

    #[test]
    fn test_unknown_fields_dropped() {
        let mut value = serde_json::to_value(EdgeConfig::default()).unwrap();
        value["some_future_field"] = serde_json::json!({"nested": true});
        let config: EdgeConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.fieldbus.port, 502);
    }

    #[test]
    fn test_missing_required_field_is_error() {
        let err = serde_json::from_str::<EdgeConfig>(r#"{"site_id": "s1"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_paths_under_reroots_everything() {
        let paths = EdgePaths::under(Path::new("/tmp/fixture"));
        assert_eq!(
            paths.active_partition_marker,
            PathBuf::from("/tmp/fixture/data/config/active_partition.txt")
        );
        assert_eq!(paths.partition_b, PathBuf::from("/tmp/fixture/partition-b"));
    }
}
