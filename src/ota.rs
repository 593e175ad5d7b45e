//! OTA Updater
//!
//! Dual-partition (A/B) staged upgrade:
//!
//! ```text
//! notice → safety gate → maintenance window → download → sha-256 →
//! signature → install to INACTIVE partition → pending marker → flip →
//! reboot → post-reboot healthcheck → commit | rollback
//! ```
//!
//! The post-reboot verifier is a separate short-lived invocation
//! (`ota-verify`): it reads `pending_version.txt` and either commits the
//! update or flips the partition marker back and reboots. Exactly one
//! partition is marked active at any time; the pending marker is consumed
//! at most once.

use chrono::{DateTime, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::{EdgeConfig, EdgePaths};
use crate::mqtt::{CloudLink, Topics};

/// OTA error types
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("update blocked: {0}")]
    Blocked(String),
    #[error("download error: {0}")]
    Download(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("signature rejected: {0}")]
    Signature(String),
    #[error("install error: {0}")]
    Install(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("status report failed: {0}")]
    Report(String),
    /// Inconsistent partition/marker state. Fatal: the process exits
    /// non-zero so the supervisor restarts into safe mode.
    #[error("partition state invariant breach: {0}")]
    Invariant(String),
}

/// Update notice published on the OTA topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaNotice {
    pub version: String,
    pub url: String,
    /// `sha256:<hex>`
    pub checksum: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub release_notes: String,
}

/// Status values published on the OTA status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    Scheduled,
    Blocked,
    Downloading,
    DownloadFailed,
    Verifying,
    ChecksumFailed,
    SignatureFailed,
    Installing,
    InstallFailed,
    Rebooting,
    UpdateSuccess,
    RollbackExecuted,
}

impl OtaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStatus::Scheduled => "SCHEDULED",
            OtaStatus::Blocked => "UPDATE_BLOCKED",
            OtaStatus::Downloading => "DOWNLOADING",
            OtaStatus::DownloadFailed => "DOWNLOAD_FAILED",
            OtaStatus::Verifying => "VERIFYING",
            OtaStatus::ChecksumFailed => "CHECKSUM_FAILED",
            OtaStatus::SignatureFailed => "SIGNATURE_FAILED",
            OtaStatus::Installing => "INSTALLING",
            OtaStatus::InstallFailed => "INSTALL_FAILED",
            OtaStatus::Rebooting => "REBOOTING",
            OtaStatus::UpdateSuccess => "UPDATE_SUCCESS",
            OtaStatus::RollbackExecuted => "ROLLBACK_EXECUTED",
        }
    }
}

/// Runtime state file read by the safety gate and the verifier; written by
/// the control loop after every safety check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalState {
    pub soc_percent: f64,
    pub power_kw: f64,
    pub active_alarm_critical: bool,
    pub island_mode: bool,
    pub updated_at: DateTime<Utc>,
}

impl OperationalState {
    pub fn read(path: &Path) -> Result<Self, OtaError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| OtaError::Install(format!("operational state parse: {e}")))
    }

    pub fn write(&self, path: &Path) -> Result<(), OtaError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string(self)
            .map_err(|e| OtaError::Install(format!("operational state encode: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// A/B partition identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    A,
    B,
}

impl Partition {
    pub fn letter(&self) -> &'static str {
        match self {
            Partition::A => "a",
            Partition::B => "b",
        }
    }

    pub fn other(&self) -> Partition {
        match self {
            Partition::A => Partition::B,
            Partition::B => Partition::A,
        }
    }
}

/// Read the active-partition marker. A missing marker defaults to A
/// (first boot); anything but `a`/`b` is an invariant breach.
pub fn active_partition(paths: &EdgePaths) -> Result<Partition, OtaError> {
    match std::fs::read_to_string(&paths.active_partition_marker) {
        Ok(content) => match content.trim() {
            "a" => Ok(Partition::A),
            "b" => Ok(Partition::B),
            other => Err(OtaError::Invariant(format!(
                "active partition marker holds '{other}'"
            ))),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Partition::A),
        Err(e) => Err(e.into()),
    }
}

/// Point the marker at `partition`. Single writer: the OTA task.
pub fn switch_active_partition(paths: &EdgePaths, partition: Partition) -> Result<(), OtaError> {
    if let Some(dir) = paths.active_partition_marker.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&paths.active_partition_marker, partition.letter())?;
    tracing::info!("active partition set to {}", partition.letter().to_uppercase());
    Ok(())
}

pub fn partition_root(paths: &EdgePaths, partition: Partition) -> &PathBuf {
    match partition {
        Partition::A => &paths.partition_a,
        Partition::B => &paths.partition_b,
    }
}

/// Environment-derived OTA policy.
#[derive(Debug, Clone)]
pub struct OtaPolicy {
    pub allowed_hosts: Vec<String>,
    pub allow_unsigned: bool,
    pub window_start_h: u32,
    pub window_end_h: u32,
    pub healthcheck_timeout: Duration,
}

impl OtaPolicy {
    pub fn from_env() -> Self {
        let allowed_hosts = std::env::var("OTA_ALLOWED_HOSTS")
            .unwrap_or_else(|_| "storage.lifo4.com.br".into())
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        let hour = |name: &str, default: u32| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            allowed_hosts,
            allow_unsigned: std::env::var("OTA_ALLOW_UNSIGNED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            window_start_h: hour("MAINTENANCE_WINDOW_START_H", 2),
            window_end_h: hour("MAINTENANCE_WINDOW_END_H", 5),
            healthcheck_timeout: Duration::from_secs(
                std::env::var("HEALTHCHECK_TIMEOUT_S")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }

    /// Validate a download URL: HTTPS only (unless the development
    /// override is set) and an allow-listed host.
    pub fn validate_url(&self, raw: &str) -> Result<url::Url, OtaError> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| OtaError::Download(format!("bad url: {e}")))?;
        match parsed.scheme() {
            "https" => {}
            "http" if self.allow_unsigned => {
                tracing::warn!("INSECURE: plain-http OTA download allowed in development mode");
            }
            other => {
                return Err(OtaError::Download(format!("scheme '{other}' not allowed")));
            }
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| OtaError::Download("url has no host".into()))?;
        if !self.allowed_hosts.iter().any(|allowed| allowed == host) {
            return Err(OtaError::Download(format!(
                "host '{host}' not in allow-list {:?}",
                self.allowed_hosts
            )));
        }
        Ok(parsed)
    }

    pub fn in_maintenance_window(&self, hour: u32) -> bool {
        if self.window_start_h <= self.window_end_h {
            hour >= self.window_start_h && hour < self.window_end_h
        } else {
            // Wrap-around windows like 22:00–02:00
            hour >= self.window_start_h || hour < self.window_end_h
        }
    }

    /// Seconds until the window opens (0 when already inside).
    pub fn seconds_until_window(&self, hour: u32, minute: u32) -> u64 {
        if self.in_maintenance_window(hour) {
            return 0;
        }
        let now_minutes = (hour * 60 + minute) as i64;
        let start_minutes = (self.window_start_h * 60) as i64;
        let mut diff = start_minutes - now_minutes;
        if diff <= 0 {
            diff += 24 * 60;
        }
        (diff * 60) as u64
    }
}

/// Reboot seam so tests can observe reboots instead of taking one.
pub trait SystemControl: Send + Sync {
    fn reboot(&self);
}

/// Shells out to the init system.
pub struct SystemReboot;

impl SystemControl for SystemReboot {
    fn reboot(&self) {
        tracing::info!("issuing reboot");
        let status = std::process::Command::new("reboot").status();
        if !matches!(status, Ok(s) if s.success()) {
            tracing::error!("reboot failed, trying shutdown -r now");
            let _ = std::process::Command::new("shutdown").args(["-r", "now"]).status();
        }
    }
}

/// Gate 1: the operational conditions under which an update may proceed.
pub fn is_safe_to_update(paths: &EdgePaths) -> Result<(), String> {
    let state = match OperationalState::read(&paths.operational_state) {
        Ok(state) => state,
        // Cannot confirm safety: block.
        Err(_) => return Err("operational state file not found".into()),
    };
    if state.active_alarm_critical {
        return Err("critical alarm active".into());
    }
    if state.island_mode {
        return Err("island mode (blackout) active".into());
    }
    if state.soc_percent < 20.0 {
        return Err(format!("soc too low ({:.1}%)", state.soc_percent));
    }
    if state.power_kw.abs() > 1.0 {
        return Err(format!(
            "active charge/discharge operation ({:.1} kW)",
            state.power_kw
        ));
    }
    Ok(())
}

/// Verify the staged image against a `sha256:<hex>` declaration.
pub fn verify_checksum(image: &Path, expected: &str) -> Result<(), OtaError> {
    let Some(expected_hex) = expected.strip_prefix("sha256:") else {
        return Err(OtaError::Checksum {
            expected: expected.into(),
            actual: "unsupported algorithm".into(),
        });
    };
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(image)?;
    std::io::copy(&mut file, &mut hasher)?;
    let actual_hex = hex::encode(hasher.finalize());
    if actual_hex.eq_ignore_ascii_case(expected_hex) {
        tracing::info!("checksum ok: {actual_hex}");
        Ok(())
    } else {
        Err(OtaError::Checksum {
            expected: expected_hex.into(),
            actual: actual_hex,
        })
    }
}

/// Verify the Ed25519 package signature against the provisioned public
/// key. Unsigned packages pass only with the development override.
pub fn verify_signature(
    image: &Path,
    signature_b64: Option<&str>,
    public_key_path: &Path,
    allow_unsigned: bool,
) -> Result<(), OtaError> {
    use base64::Engine;
    use ed25519_dalek::pkcs8::DecodePublicKey;
    use ed25519_dalek::{Signature, VerifyingKey};

    let Some(signature_b64) = signature_b64 else {
        if allow_unsigned {
            tracing::warn!("INSECURE: unsigned OTA package accepted (OTA_ALLOW_UNSIGNED=true)");
            return Ok(());
        }
        return Err(OtaError::Signature("package carries no signature".into()));
    };

    let pem = match std::fs::read_to_string(public_key_path) {
        Ok(pem) => pem,
        Err(_) if allow_unsigned => {
            tracing::warn!(
                "INSECURE: signing key missing at {}, skipping verification",
                public_key_path.display()
            );
            return Ok(());
        }
        Err(e) => {
            return Err(OtaError::Signature(format!(
                "signing key unavailable at {}: {e}",
                public_key_path.display()
            )));
        }
    };

    let key = VerifyingKey::from_public_key_pem(&pem)
        .map_err(|e| OtaError::Signature(format!("bad public key: {e}")))?;
    let signature_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|e| OtaError::Signature(format!("bad base64: {e}")))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| OtaError::Signature(format!("bad signature encoding: {e}")))?;
    let image_bytes = std::fs::read(image)?;
    key.verify_strict(&image_bytes, &signature)
        .map_err(|e| OtaError::Signature(format!("verification failed: {e}")))?;
    tracing::info!("package signature verified");
    Ok(())
}

/// Extract the canonical `.tar.gz` image into the target partition root.
/// The active partition is never a valid target.
pub async fn install_to_partition(image: &Path, target: &Path) -> Result<(), OtaError> {
    let name = image.to_string_lossy();
    if !(name.ends_with(".tar.gz") || name.ends_with(".tgz")) {
        return Err(OtaError::Install(format!(
            "unsupported image format: {name} (expected .tar.gz)"
        )));
    }
    tokio::fs::create_dir_all(target).await?;
    let status = tokio::process::Command::new("tar")
        .arg("-xzf")
        .arg(image)
        .arg("-C")
        .arg(target)
        .status()
        .await
        .map_err(|e| OtaError::Install(format!("tar spawn: {e}")))?;
    if !status.success() {
        return Err(OtaError::Install(format!("tar exited with {status}")));
    }
    tracing::info!("image installed into {}", target.display());
    Ok(())
}

/// The staged-update driver living in the long-running edge process.
pub struct OtaUpdater<L: CloudLink, S: SystemControl> {
    paths: EdgePaths,
    policy: OtaPolicy,
    link: std::sync::Arc<L>,
    topics: Topics,
    system: S,
}

impl<L: CloudLink, S: SystemControl> OtaUpdater<L, S> {
    pub fn new(
        paths: EdgePaths,
        policy: OtaPolicy,
        link: std::sync::Arc<L>,
        topics: Topics,
        system: S,
    ) -> Self {
        Self {
            paths,
            policy,
            link,
            topics,
            system,
        }
    }

    /// Task body: idle until a notice arrives, then run it to completion.
    pub async fn run(self, mut rx: mpsc::Receiver<OtaNotice>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("ota updater waiting for notices");
        loop {
            tokio::select! {
                notice = rx.recv() => {
                    let Some(notice) = notice else { return };
                    tracing::info!(version = %notice.version, "update notice received");
                    if let Err(e) = self.handle_notice(&notice).await {
                        tracing::error!("update v{} failed: {e}", notice.version);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("ota updater stopping");
                        return;
                    }
                }
            }
        }
    }

    pub async fn handle_notice(&self, notice: &OtaNotice) -> Result<(), OtaError> {
        // Gate 2 first: outside the window we only wait, not touch state.
        loop {
            let now = Local::now();
            let wait = self.policy.seconds_until_window(now.hour(), now.minute());
            if wait > 0 {
                tracing::info!(
                    "outside maintenance window, update v{} scheduled in {} min",
                    notice.version,
                    wait / 60
                );
                self.report(OtaStatus::Scheduled, &notice.version).await;
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            // Gate 1: operational safety, re-checked every 15 minutes
            // while blocked.
            match is_safe_to_update(&self.paths) {
                Ok(()) => break,
                Err(reason) => {
                    tracing::warn!("update blocked: {reason}, retry in 15 min");
                    self.report(OtaStatus::Blocked, &notice.version).await;
                    tokio::time::sleep(Duration::from_secs(900)).await;
                }
            }
        }

        self.execute(notice).await
    }

    async fn execute(&self, notice: &OtaNotice) -> Result<(), OtaError> {
        self.report(OtaStatus::Downloading, &notice.version).await;
        let image = match self.download(notice).await {
            Ok(image) => image,
            Err(e) => {
                self.report(OtaStatus::DownloadFailed, &notice.version).await;
                return Err(e);
            }
        };

        self.report(OtaStatus::Verifying, &notice.version).await;
        if let Err(e) = verify_checksum(&image, &notice.checksum) {
            self.report(OtaStatus::ChecksumFailed, &notice.version).await;
            return Err(e);
        }
        if let Err(e) = verify_signature(
            &image,
            notice.signature.as_deref(),
            &self.paths.signing_public_key,
            self.policy.allow_unsigned,
        ) {
            self.report(OtaStatus::SignatureFailed, &notice.version).await;
            return Err(e);
        }

        self.report(OtaStatus::Installing, &notice.version).await;
        let active = active_partition(&self.paths)?;
        let candidate = active.other();
        let target = partition_root(&self.paths, candidate).clone();
        if let Err(e) = install_to_partition(&image, &target).await {
            self.report(OtaStatus::InstallFailed, &notice.version).await;
            return Err(e);
        }

        // Pending marker first, then the flip: a crash between the two
        // leaves the old partition active and the marker consumable.
        if let Some(dir) = self.paths.pending_version.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.paths.pending_version, &notice.version)?;
        switch_active_partition(&self.paths, candidate)?;

        self.report(OtaStatus::Rebooting, &notice.version).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.system.reboot();
        Ok(())
    }

    /// Stream the image into staging. Bounded only by the remaining
    /// maintenance window.
    async fn download(&self, notice: &OtaNotice) -> Result<PathBuf, OtaError> {
        let url = self.policy.validate_url(&notice.url)?;
        tokio::fs::create_dir_all(&self.paths.ota_staging).await?;
        let image = self.paths.ota_staging.join("update.tar.gz");

        let window_hours = (self.policy.window_end_h + 24 - self.policy.window_start_h) % 24;
        let budget = Duration::from_secs(u64::from(window_hours.max(1)) * 3600);

        let fetch = async {
            let response = reqwest::get(url.as_str())
                .await
                .map_err(|e| OtaError::Download(e.to_string()))?
                .error_for_status()
                .map_err(|e| OtaError::Download(e.to_string()))?;
            let mut file = tokio::fs::File::create(&image).await?;
            let mut response = response;
            let mut total: u64 = 0;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| OtaError::Download(e.to_string()))?
            {
                tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
                total += chunk.len() as u64;
            }
            tokio::io::AsyncWriteExt::flush(&mut file).await?;
            tracing::info!("download complete: {:.1} MB", total as f64 / 1_048_576.0);
            Ok::<PathBuf, OtaError>(image.clone())
        };

        match tokio::time::timeout(budget, fetch).await {
            Ok(result) => result,
            Err(_) => Err(OtaError::Download("maintenance window exhausted".into())),
        }
    }

    async fn report(&self, status: OtaStatus, version: &str) {
        let partition = active_partition(&self.paths)
            .map(|p| p.letter().to_string())
            .unwrap_or_else(|_| "?".into());
        let payload = serde_json::json!({
            "status": status.as_str(),
            "version": version,
            "active_partition": partition,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self
            .link
            .publish_confirmed(&self.topics.ota_status(), payload.to_string().into_bytes())
            .await
        {
            tracing::warn!("ota status publish failed: {e}");
        }
    }
}

/// Outcome of a post-reboot verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// No pending marker: nothing to do (idempotent).
    NoPending,
    Committed(String),
    RolledBack(String),
}

/// Post-reboot healthcheck results.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthChecks {
    pub control_loop_ok: bool,
    pub fieldbus_ok: bool,
    pub mqtt_ok: bool,
    pub safety_manager_ok: bool,
}

impl HealthChecks {
    pub fn all_ok(&self) -> bool {
        self.control_loop_ok && self.fieldbus_ok && self.mqtt_ok && self.safety_manager_ok
    }
}

/// Freshness bound for the operational state file: the control loop writes
/// it every cycle, so a stale file means the loop (or the safety manager
/// feeding it) is not running.
fn state_freshness() -> chrono::Duration {
    chrono::Duration::seconds(10)
}

/// The short-lived post-reboot verifier.
pub struct OtaVerifier<S: SystemControl> {
    paths: EdgePaths,
    policy: OtaPolicy,
    system: S,
}

impl<S: SystemControl> OtaVerifier<S> {
    pub fn new(paths: EdgePaths, policy: OtaPolicy, system: S) -> Self {
        Self {
            paths,
            policy,
            system,
        }
    }

    /// Commit or roll back a staged update. No-op without a pending marker.
    pub async fn run(&self) -> Result<VerifyOutcome, OtaError> {
        let pending = match std::fs::read_to_string(&self.paths.pending_version) {
            Ok(version) => version.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no pending ota, nothing to verify");
                return Ok(VerifyOutcome::NoPending);
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(version = %pending, "post-reboot healthcheck started");

        let deadline = tokio::time::Instant::now() + self.policy.healthcheck_timeout;
        loop {
            let checks = self.healthcheck().await;
            tracing::info!(
                control_loop = checks.control_loop_ok,
                fieldbus = checks.fieldbus_ok,
                mqtt = checks.mqtt_ok,
                safety = checks.safety_manager_ok,
                "healthcheck round"
            );
            if checks.all_ok() {
                self.commit(&pending)?;
                return Ok(VerifyOutcome::Committed(pending));
            }
            if tokio::time::Instant::now() >= deadline {
                self.rollback()?;
                return Ok(VerifyOutcome::RolledBack(pending));
            }
            tokio::time::sleep(Duration::from_secs(15).min(self.policy.healthcheck_timeout)).await;
        }
    }

    async fn healthcheck(&self) -> HealthChecks {
        let mut checks = HealthChecks::default();

        // Control loop + safety manager: the state file is written right
        // after each safety check, so freshness proves both.
        if let Ok(state) = OperationalState::read(&self.paths.operational_state) {
            checks.safety_manager_ok =
                state.soc_percent.is_finite() && (0.0..=100.0).contains(&state.soc_percent);
            checks.control_loop_ok = Utc::now() - state.updated_at < state_freshness();
        }

        // Field bus + broker reachability (transport level).
        if let Ok(config) = EdgeConfig::load(&self.paths.device_config) {
            checks.fieldbus_ok =
                tcp_reachable(&config.fieldbus.host, config.fieldbus.port).await;
            checks.mqtt_ok =
                tcp_reachable(&config.mqtt.broker_host, config.mqtt.broker_port).await;
        }
        checks
    }

    fn commit(&self, version: &str) -> Result<(), OtaError> {
        if let Some(dir) = self.paths.version_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.paths.version_file, version)?;
        std::fs::remove_file(&self.paths.pending_version)?;
        tracing::info!(version, "ota committed, v{version} is now active");
        Ok(())
    }

    fn rollback(&self) -> Result<(), OtaError> {
        let active = active_partition(&self.paths)?;
        switch_active_partition(&self.paths, active.other())?;
        tracing::error!("healthcheck window expired, rolling back to partition {}", active.other().letter());
        self.system.reboot();
        Ok(())
    }
}

/// One-shot QoS-1 status publish for the short-lived verifier process:
/// connect, publish, wait for the broker ack, disconnect.
pub async fn publish_status_once(
    mqtt: &crate::config::MqttConfig,
    client_id: &str,
    topic: &str,
    payload: Vec<u8>,
) -> Result<(), OtaError> {
    use rumqttc::{AsyncClient, Event, Packet, QoS};

    let options = crate::mqtt::build_mqtt_options(
        client_id,
        &mqtt.broker_host,
        mqtt.broker_port,
        &mqtt.cert_dir,
        10,
    );
    let (client, mut eventloop) = AsyncClient::new(options, 8);
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        let mut published = false;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) if !published => {
                    published = true;
                    client
                        .publish(topic, QoS::AtLeastOnce, false, payload.clone())
                        .await
                        .map_err(|e| OtaError::Report(e.to_string()))?;
                }
                Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(OtaError::Report(e.to_string())),
            }
        }
    })
    .await;
    let _ = client.disconnect().await;
    match result {
        Ok(inner) => inner,
        Err(_) => Err(OtaError::Report("status publish timed out".into())),
    }
}

async fn tcp_reachable(host: &str, port: u16) -> bool {
    tokio::time::timeout(
        Duration::from_secs(3),
        tokio::net::TcpStream::connect((host, port)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::pkcs8::EncodePublicKey;
    use ed25519_dalek::{Signer, SigningKey};

    fn policy() -> OtaPolicy {
        OtaPolicy {
            allowed_hosts: vec!["storage.lifo4.com.br".into()],
            allow_unsigned: false,
            window_start_h: 2,
            window_end_h: 5,
            healthcheck_timeout: Duration::from_secs(300),
        }
    }

    struct RecordingReboot(std::sync::atomic::AtomicU32);

    impl RecordingReboot {
        fn new() -> Self {
            Self(std::sync::atomic::AtomicU32::new(0))
        }
        fn count(&self) -> u32 {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl SystemControl for &RecordingReboot {
        fn reboot(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn operational_state(soc: f64, power: f64) -> OperationalState {
        OperationalState {
            soc_percent: soc,
            power_kw: power,
            active_alarm_critical: false,
            island_mode: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_maintenance_window_inside_outside() {
        let policy = policy();
        assert!(policy.in_maintenance_window(2));
        assert!(policy.in_maintenance_window(4));
        assert!(!policy.in_maintenance_window(5));
        assert!(!policy.in_maintenance_window(14));
    }

    #[test]
    fn test_maintenance_window_wraps_midnight() {
        let mut policy = policy();
        policy.window_start_h = 22;
        policy.window_end_h = 2;
        assert!(policy.in_maintenance_window(23));
        assert!(policy.in_maintenance_window(1));
        assert!(!policy.in_maintenance_window(12));
    }

    #[test]
    fn test_seconds_until_window() {
        let policy = policy();
        assert_eq!(policy.seconds_until_window(3, 0), 0);
        assert_eq!(policy.seconds_until_window(1, 0), 3600);
        // 14:30 → next 02:00 is 11.5 h away
        assert_eq!(policy.seconds_until_window(14, 30), 11 * 3600 + 1800);
    }

    #[test]
    fn test_url_validation() {
        let policy = policy();
        assert!(policy
            .validate_url("https://storage.lifo4.com.br/fw/v1.1.0.tar.gz")
            .is_ok());
        assert!(policy
            .validate_url("https://evil.example.com/fw.tar.gz")
            .is_err());
        assert!(policy
            .validate_url("http://storage.lifo4.com.br/fw.tar.gz")
            .is_err());
        assert!(policy.validate_url("not a url").is_err());

        let mut dev = policy;
        dev.allow_unsigned = true;
        assert!(dev.validate_url("http://storage.lifo4.com.br/fw.tar.gz").is_ok());
    }

    #[test]
    fn test_safety_gate_conditions() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = EdgePaths::under(tmp.path());

        // No state file → blocked
        assert!(is_safe_to_update(&paths).is_err());

        operational_state(55.0, 0.0)
            .write(&paths.operational_state)
            .unwrap();
        assert!(is_safe_to_update(&paths).is_ok());

        operational_state(15.0, 0.0)
            .write(&paths.operational_state)
            .unwrap();
        assert!(is_safe_to_update(&paths).unwrap_err().contains("soc"));

        operational_state(55.0, 25.0)
            .write(&paths.operational_state)
            .unwrap();
        assert!(is_safe_to_update(&paths)
            .unwrap_err()
            .contains("charge/discharge"));

        let mut state = operational_state(55.0, 0.0);
        state.island_mode = true;
        state.write(&paths.operational_state).unwrap();
        assert!(is_safe_to_update(&paths).unwrap_err().contains("island"));

        let mut state = operational_state(55.0, 0.0);
        state.active_alarm_critical = true;
        state.write(&paths.operational_state).unwrap();
        assert!(is_safe_to_update(&paths).unwrap_err().contains("alarm"));
    }

    #[test]
    fn test_checksum_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("update.tar.gz");
        std::fs::write(&image, b"firmware bytes").unwrap();

        let digest = hex::encode(Sha256::digest(b"firmware bytes"));
        verify_checksum(&image, &format!("sha256:{digest}")).unwrap();

        let err = verify_checksum(&image, "sha256:deadbeef").unwrap_err();
        assert!(matches!(err, OtaError::Checksum { .. }));

        let err = verify_checksum(&image, "md5:abc").unwrap_err();
        assert!(matches!(err, OtaError::Checksum { .. }));
    }

    #[test]
    fn test_signature_verification() {
        use base64::Engine;

        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("update.tar.gz");
        std::fs::write(&image, b"firmware bytes").unwrap();

        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let key_path = tmp.path().join("code-signing.pub");
        std::fs::write(
            &key_path,
            signing_key
                .verifying_key()
                .to_public_key_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
                .unwrap(),
        )
        .unwrap();

        let signature = signing_key.sign(b"firmware bytes");
        let signature_b64 =
            base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        verify_signature(&image, Some(&signature_b64), &key_path, false).unwrap();

        // Tampered image fails
        std::fs::write(&image, b"tampered bytes").unwrap();
        assert!(verify_signature(&image, Some(&signature_b64), &key_path, false).is_err());

        // Unsigned rejected in production, accepted in development
        assert!(verify_signature(&image, None, &key_path, false).is_err());
        verify_signature(&image, None, &key_path, true).unwrap();
    }

    #[test]
    fn test_partition_marker_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = EdgePaths::under(tmp.path());

        // Missing marker defaults to A
        assert_eq!(active_partition(&paths).unwrap(), Partition::A);

        switch_active_partition(&paths, Partition::B).unwrap();
        assert_eq!(active_partition(&paths).unwrap(), Partition::B);
        assert_eq!(active_partition(&paths).unwrap().other(), Partition::A);

        // Garbage content is an invariant breach
        std::fs::write(&paths.active_partition_marker, "c").unwrap();
        assert!(matches!(
            active_partition(&paths),
            Err(OtaError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_install_rejects_non_tarball() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("update.img");
        std::fs::write(&image, b"raw").unwrap();
        let err = install_to_partition(&image, &tmp.path().join("partition-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::Install(_)));
    }

    #[tokio::test]
    async fn test_install_extracts_tarball() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("rootfs");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("edge.bin"), b"new version").unwrap();

        let image = tmp.path().join("update.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&image)
            .arg("-C")
            .arg(&source)
            .arg(".")
            .status()
            .unwrap();
        assert!(status.success());

        let target = tmp.path().join("partition-b");
        install_to_partition(&image, &target).await.unwrap();
        assert_eq!(std::fs::read(target.join("edge.bin")).unwrap(), b"new version");
    }

    #[tokio::test]
    async fn test_verifier_noop_without_pending_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = EdgePaths::under(tmp.path());
        let reboot = RecordingReboot::new();
        let verifier = OtaVerifier::new(paths, policy(), &reboot);

        assert_eq!(verifier.run().await.unwrap(), VerifyOutcome::NoPending);
        // Calling it again is still a no-op
        assert_eq!(verifier.run().await.unwrap(), VerifyOutcome::NoPending);
        assert_eq!(reboot.count(), 0);
    }

    #[tokio::test]
    async fn test_verifier_rolls_back_on_failed_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = EdgePaths::under(tmp.path());
        std::fs::create_dir_all(paths.pending_version.parent().unwrap()).unwrap();
        std::fs::write(&paths.pending_version, "1.1.0").unwrap();
        switch_active_partition(&paths, Partition::B).unwrap();
        std::fs::create_dir_all(paths.version_file.parent().unwrap()).unwrap();
        std::fs::write(&paths.version_file, "1.0.0").unwrap();

        let mut short = policy();
        short.healthcheck_timeout = Duration::from_millis(10);
        let reboot = RecordingReboot::new();
        let verifier = OtaVerifier::new(paths.clone(), short, &reboot);

        // No operational state / no listeners: every check fails.
        let outcome = verifier.run().await.unwrap();
        assert_eq!(outcome, VerifyOutcome::RolledBack("1.1.0".into()));
        // Flipped back to A and rebooted; old version marker intact
        assert_eq!(active_partition(&paths).unwrap(), Partition::A);
        assert_eq!(reboot.count(), 1);
        assert_eq!(std::fs::read_to_string(&paths.version_file).unwrap(), "1.0.0");
    }

    #[tokio::test]
    async fn test_verifier_commits_when_healthy() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = EdgePaths::under(tmp.path());
        std::fs::create_dir_all(paths.pending_version.parent().unwrap()).unwrap();
        std::fs::write(&paths.pending_version, "1.1.0").unwrap();
        switch_active_partition(&paths, Partition::B).unwrap();

        // Fresh operational state, and live listeners for bus + broker.
        operational_state(55.0, 0.0)
            .write(&paths.operational_state)
            .unwrap();
        let bus_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = EdgeConfig::default();
        config.fieldbus.host = "127.0.0.1".into();
        config.fieldbus.port = bus_listener.local_addr().unwrap().port();
        config.mqtt.broker_host = "127.0.0.1".into();
        config.mqtt.broker_port = broker_listener.local_addr().unwrap().port();
        config.save(&paths.device_config).unwrap();

        let reboot = RecordingReboot::new();
        let verifier = OtaVerifier::new(paths.clone(), policy(), &reboot);
        let outcome = verifier.run().await.unwrap();

        assert_eq!(outcome, VerifyOutcome::Committed("1.1.0".into()));
        // Marker consumed exactly once; running version updated; no reboot
        assert!(!paths.pending_version.exists());
        assert_eq!(std::fs::read_to_string(&paths.version_file).unwrap(), "1.1.0");
        assert_eq!(active_partition(&paths).unwrap(), Partition::B);
        assert_eq!(reboot.count(), 0);
    }
}
