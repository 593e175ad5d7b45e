//! Zero-Touch Provisioning
//!
//! One-shot, idempotent bootstrap: derive the device identity from
//! hardware, register over the bootstrap credential, wait for the
//! per-device config, pivot to the permanent credentials, discover field
//! bus devices, and report operational. A technician only installs
//! hardware; every other step is automatic.

use chrono::Utc;
use rumqttc::{AsyncClient, Event, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{EdgeConfig, EdgePaths, FieldBusConfig, OptimizationConfig};
use crate::fieldbus::{FieldBus, ModbusFieldBus};
use crate::identity::{local_ip, DeviceIdentity};
use crate::mqtt::build_mqtt_options;
use crate::safety::Threshold;

const TOPIC_REGISTER: &str = "lifo4/provisioning/register";

/// Provisioning error types
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("broker error: {0}")]
    Broker(String),
    #[error("timed out waiting for cloud config")]
    Timeout,
    #[error("invalid cloud config: {0}")]
    ConfigInvalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provisioning state, recorded to disk at every transition so a failed
/// bootstrap leaves a diagnosable trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningState {
    Init,
    Connecting,
    Registering,
    WaitingConfig,
    Configuring,
    Discovering,
    Operational,
    Failed,
}

/// Registration payload published on the shared provisioning topic.
#[derive(Debug, Serialize)]
pub struct RegistrationPayload {
    pub edge_id: String,
    pub mac_address: String,
    pub hardware: String,
    pub software_version: String,
    pub ip_address: String,
    pub timestamp: String,
    pub serial_number: String,
    pub capabilities: Vec<String>,
    pub cpu_cores: usize,
    pub memory_mb: u64,
}

/// Per-device config message from the cloud.
#[derive(Debug, Deserialize)]
pub struct CloudProvisionConfig {
    pub site_id: String,
    pub system_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub modbus_config: Option<FieldBusConfig>,
    #[serde(default)]
    pub mqtt_config: ProvisionMqttConfig,
    #[serde(default)]
    pub optimization_config: Option<OptimizationConfig>,
    #[serde(default)]
    pub safety_limits: Vec<Threshold>,
}

/// Permanent credentials and broker coordinates delivered at provisioning.
#[derive(Debug, Default, Deserialize)]
pub struct ProvisionMqttConfig {
    #[serde(default)]
    pub broker_host: Option<String>,
    #[serde(default)]
    pub broker_port: Option<u16>,
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
}

/// A field bus device found during discovery.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub unit_id: u8,
}

pub struct Bootstrap {
    paths: EdgePaths,
    broker_host: String,
    broker_port: u16,
    timeout: Duration,
    state: ProvisioningState,
}

impl Bootstrap {
    pub fn new(paths: EdgePaths) -> Self {
        let broker_host =
            std::env::var("MQTT_BROKER_HOST").unwrap_or_else(|_| "mqtt.lifo4.com.br".into());
        let broker_port = std::env::var("MQTT_BROKER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8883);
        let timeout = Duration::from_secs(
            std::env::var("PROVISIONING_TIMEOUT_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        );
        Self {
            paths,
            broker_host,
            broker_port,
            timeout,
            state: ProvisioningState::Init,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Execute the bootstrap. Running on an already-provisioned device is
    /// a no-op that returns the saved config.
    pub async fn run(&mut self) -> Result<EdgeConfig, ProvisioningError> {
        if let Some(existing) = load_existing_config(&self.paths.device_config) {
            tracing::info!(edge_id = %existing.edge_id, "already provisioned, skipping bootstrap");
            return Ok(existing);
        }

        let identity = DeviceIdentity::detect(&self.paths.version_file);
        tracing::info!(
            edge_id = %identity.edge_id,
            mac = %identity.mac,
            hardware = %identity.hardware_model,
            "starting zero-touch provisioning"
        );

        let result = self.provision(&identity).await;
        if let Err(e) = &result {
            self.record_state(ProvisioningState::Failed, Some(&e.to_string()));
        }
        result
    }

    async fn provision(
        &mut self,
        identity: &DeviceIdentity,
    ) -> Result<EdgeConfig, ProvisioningError> {
        // ── Connect with the bootstrap credential ────────────────────────
        self.set_state(ProvisioningState::Connecting);
        let options = build_mqtt_options(
            &identity.edge_id,
            &self.broker_host,
            self.broker_port,
            &self.paths.bootstrap_cert_dir,
            30,
        );
        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let config_topic = format!("lifo4/provisioning/{}/config", identity.edge_id);

        // ── Register, then wait for our per-device config ────────────────
        let deadline = Instant::now() + self.timeout;
        let mut registered = false;
        let cloud_config: CloudProvisionConfig = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProvisioningError::Timeout);
            }
            let event = tokio::time::timeout(remaining, eventloop.poll())
                .await
                .map_err(|_| ProvisioningError::Timeout)?
                .map_err(|e| ProvisioningError::Broker(e.to_string()))?;

            match event {
                Event::Incoming(Packet::ConnAck(_)) => {
                    tracing::info!("broker connected (bootstrap credential)");
                    client
                        .subscribe(&config_topic, QoS::AtLeastOnce)
                        .await
                        .map_err(|e| ProvisioningError::Broker(e.to_string()))?;
                }
                Event::Incoming(Packet::SubAck(_)) if !registered => {
                    registered = true;
                    self.set_state(ProvisioningState::Registering);
                    let payload = registration_payload(identity);
                    client
                        .publish(
                            TOPIC_REGISTER,
                            QoS::AtLeastOnce,
                            false,
                            serde_json::to_vec(&payload)
                                .map_err(|e| ProvisioningError::ConfigInvalid(e.to_string()))?,
                        )
                        .await
                        .map_err(|e| ProvisioningError::Broker(e.to_string()))?;
                    tracing::info!(edge_id = %identity.edge_id, "registration published");
                    self.set_state(ProvisioningState::WaitingConfig);
                }
                Event::Incoming(Packet::Publish(publish)) if publish.topic == config_topic => {
                    break serde_json::from_slice(&publish.payload)
                        .map_err(|e| ProvisioningError::ConfigInvalid(e.to_string()))?;
                }
                _ => {}
            }
        };
        tracing::info!(
            site = %cloud_config.site_id,
            system = %cloud_config.system_id,
            org = %cloud_config.organization_id,
            "cloud config received"
        );

        // ── Install permanent credentials, persist config atomically ─────
        self.set_state(ProvisioningState::Configuring);
        install_permanent_credentials(&cloud_config.mqtt_config, &self.paths.device_cert_dir)?;
        let config = build_edge_config(identity, cloud_config);
        config
            .save(&self.paths.device_config)
            .map_err(ProvisioningError::Io)?;
        tracing::info!("device config saved to {}", self.paths.device_config.display());

        // ── Field bus discovery ──────────────────────────────────────────
        self.set_state(ProvisioningState::Discovering);
        let devices = discover_devices(&config.fieldbus).await;
        tracing::info!("discovered {} field bus device(s)", devices.len());

        // ── Report operational on the per-site status topic ──────────────
        self.set_state(ProvisioningState::Operational);
        let status = serde_json::json!({
            "edge_id": identity.edge_id,
            "status": "PROVISIONED_AND_OPERATIONAL",
            "discovered_devices": devices,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let status_topic = format!("lifo4/{}/status", config.site_id);
        if let Err(e) = client
            .publish(
                &status_topic,
                QoS::AtLeastOnce,
                false,
                status.to_string().into_bytes(),
            )
            .await
        {
            tracing::warn!("operational report failed: {e}");
        }
        // Flush the publish before dropping the event loop.
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
        .await;
        let _ = client.disconnect().await;

        tracing::info!("bootstrap complete");
        Ok(config)
    }

    fn set_state(&mut self, state: ProvisioningState) {
        self.state = state;
        self.record_state(state, None);
    }

    fn record_state(&self, state: ProvisioningState, error: Option<&str>) {
        let record = serde_json::json!({
            "state": state,
            "error": error,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(dir) = self.paths.provisioning_state.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(e) = std::fs::write(&self.paths.provisioning_state, record.to_string()) {
            tracing::warn!("provisioning state record failed: {e}");
        }
    }
}

/// Saved config, if the device is already provisioned. A corrupt file is
/// treated as unprovisioned so the bootstrap runs again.
pub fn load_existing_config(path: &Path) -> Option<EdgeConfig> {
    if !path.exists() {
        return None;
    }
    match EdgeConfig::load(path) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("corrupt device config ({e}), re-provisioning");
            None
        }
    }
}

fn registration_payload(identity: &DeviceIdentity) -> RegistrationPayload {
    RegistrationPayload {
        edge_id: identity.edge_id.clone(),
        mac_address: identity.mac.clone(),
        hardware: identity.hardware_model.clone(),
        software_version: identity.software_version.clone(),
        ip_address: local_ip(),
        timestamp: Utc::now().to_rfc3339(),
        serial_number: identity.serial.clone(),
        capabilities: vec![
            "modbus-tcp".into(),
            "mqtt".into(),
            "sqlite".into(),
            "ota-ab".into(),
        ],
        cpu_cores: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        memory_mb: total_memory_mb(),
    }
}

fn total_memory_mb() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
        .unwrap_or(0)
}

/// Write the permanent client certificate set delivered by the cloud.
fn install_permanent_credentials(
    mqtt: &ProvisionMqttConfig,
    cert_dir: &Path,
) -> Result<(), ProvisioningError> {
    std::fs::create_dir_all(cert_dir)?;
    for (name, pem) in [
        ("ca.crt", &mqtt.ca_cert),
        ("client.crt", &mqtt.client_cert),
        ("client.key", &mqtt.client_key),
    ] {
        if let Some(pem) = pem {
            std::fs::write(cert_dir.join(name), pem)?;
        }
    }
    tracing::info!("permanent credentials installed at {}", cert_dir.display());
    Ok(())
}

/// Merge the cloud-delivered pieces over the compiled defaults.
fn build_edge_config(identity: &DeviceIdentity, cloud: CloudProvisionConfig) -> EdgeConfig {
    let mut config = EdgeConfig::default();
    config.edge_id = identity.edge_id.clone();
    config.site_id = cloud.site_id;
    config.system_id = cloud.system_id;
    config.organization_id = cloud.organization_id;
    if let Some(fieldbus) = cloud.modbus_config {
        config.fieldbus = fieldbus;
    }
    if let Some(host) = cloud.mqtt_config.broker_host {
        config.mqtt.broker_host = host;
    }
    if let Some(port) = cloud.mqtt_config.broker_port {
        config.mqtt.broker_port = port;
    }
    if let Some(optimization) = cloud.optimization_config {
        config.optimization = optimization;
    }
    config.safety_limits = cloud.safety_limits;
    config
}

/// Probe the configured unit-address range for responding devices.
async fn discover_devices(fieldbus: &FieldBusConfig) -> Vec<DiscoveredDevice> {
    let bus = ModbusFieldBus::new(fieldbus.clone());
    let (first, last) = fieldbus.discovery_unit_ids;
    let mut devices = Vec::new();
    for unit_id in first..=last {
        if bus.probe(unit_id).await {
            tracing::info!("found device at unit_id={unit_id}");
            devices.push(DiscoveredDevice { unit_id });
        }
    }
    devices
}
