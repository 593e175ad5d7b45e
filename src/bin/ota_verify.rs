//! Post-Reboot OTA Verifier
//!
//! Short-lived invocation run on boot. Reads `pending_version.txt` and
//! either commits the staged update (all healthchecks pass inside the
//! window) or flips the partition marker back and reboots. With no pending
//! marker it exits immediately, so calling it again is always safe.

use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lifo4_edge::config::{EdgeConfig, EdgePaths};
use lifo4_edge::mqtt::Topics;
use lifo4_edge::ota::{
    self, OtaPolicy, OtaStatus, OtaVerifier, SystemReboot, VerifyOutcome,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let paths = EdgePaths::default();
    let policy = OtaPolicy::from_env();
    let verifier = OtaVerifier::new(paths.clone(), policy, SystemReboot);

    let outcome = match verifier.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("ota verification failed: {e}");
            std::process::exit(1);
        }
    };

    let (status, version) = match &outcome {
        VerifyOutcome::NoPending => {
            tracing::info!("no pending update");
            std::process::exit(0);
        }
        VerifyOutcome::Committed(version) => (OtaStatus::UpdateSuccess, version.clone()),
        VerifyOutcome::RolledBack(version) => (OtaStatus::RollbackExecuted, version.clone()),
    };

    // Report the terminal state; a failed report does not fail the verify.
    if let Ok(config) = EdgeConfig::load(&paths.device_config) {
        let partition = ota::active_partition(&paths)
            .map(|p| p.letter().to_string())
            .unwrap_or_else(|_| "?".into());
        let payload = serde_json::json!({
            "status": status.as_str(),
            "version": version,
            "active_partition": partition,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let topics = Topics::new(&config.site_id);
        let client_id = format!("ota-{}", config.edge_id);
        if let Err(e) = ota::publish_status_once(
            &config.mqtt,
            &client_id,
            &topics.ota_status(),
            payload.to_string().into_bytes(),
        )
        .await
        {
            tracing::warn!("could not report ota status: {e}");
        }
    }

    tracing::info!("ota verification complete: {:?}", outcome);
}
