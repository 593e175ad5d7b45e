//! Device Identity
//!
//! Stable across reboots: every field is derived deterministically from the
//! hardware, so re-imaging a controller never changes its `edge_id`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub edge_id: String,
    pub mac: String,
    pub serial: String,
    pub hardware_model: String,
    pub software_version: String,
}

impl DeviceIdentity {
    /// Detect identity from the running hardware.
    pub fn detect(version_file: &Path) -> Self {
        let mac = detect_mac();
        let serial = detect_serial(&mac);
        Self {
            edge_id: build_edge_id(&mac, &serial),
            mac,
            serial,
            hardware_model: detect_hardware_model(),
            software_version: crate::config::software_version(version_file),
        }
    }
}

/// Deterministic edge ID from MAC + serial.
pub fn build_edge_id(mac: &str, serial: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mac.as_bytes());
    hasher.update(b"-");
    hasher.update(serial.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("edge-{}", &digest[..12])
}

/// Primary network interface MAC address, uppercased.
fn detect_mac() -> String {
    for iface in ["eth0", "enp1s0", "ens3", "wlan0"] {
        let path = format!("/sys/class/net/{iface}/address");
        if let Ok(mac) = std::fs::read_to_string(&path) {
            let mac = mac.trim().to_uppercase();
            if !mac.is_empty() {
                return mac;
            }
        }
    }
    "00:00:00:00:00:00".into()
}

/// Hardware serial (Jetson/RPi expose it in /proc/cpuinfo); falls back to a
/// digest of the MAC so the result is still stable.
fn detect_serial(mac: &str) -> String {
    if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
        for line in cpuinfo.lines() {
            if line.starts_with("Serial") {
                if let Some(serial) = line.split(':').nth(1) {
                    let serial = serial.trim();
                    if !serial.is_empty() {
                        return serial.to_uppercase();
                    }
                }
            }
        }
    }
    let digest = hex::encode(Sha256::digest(mac.as_bytes()));
    digest[..16].to_uppercase()
}

fn detect_hardware_model() -> String {
    if let Ok(model) = std::fs::read_to_string("/proc/device-tree/model") {
        let model = model.trim_matches(char::from(0)).trim().to_string();
        if !model.is_empty() {
            return model;
        }
    }
    "generic-x86".into()
}

/// Outbound IP address, best effort (used only in the registration payload).
pub fn local_ip() -> String {
    use std::net::UdpSocket;
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".into())
}
