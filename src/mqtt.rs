//! Cloud Messaging Client
//!
//! Mutually-authenticated MQTT link to the cloud coordinator. The event
//! loop task owns reconnection (exponential backoff `1,2,4,8,16,30,60` s
//! with jitter), re-subscribes on every reconnect, and routes inbound
//! messages through a topic table: commands go to the control loop's
//! command queue, config messages update the Cache Manager directly, OTA
//! notices wake the OTA task.
//!
//! QoS-1 publishes go through [`CloudLink::publish_confirmed`], which
//! resolves only once the broker's PUBACK arrives; callers replay failures
//! from the durable queue, so nothing is dropped on the floor.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::{
    AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::cache::CacheManager;
use crate::config::{MqttConfig, OptimizationConfig};
use crate::engine::CloudCommand;
use crate::ota::OtaNotice;

/// Reconnect ladder, capped at the last entry.
const BACKOFF_SECS: [u64; 7] = [1, 2, 4, 8, 16, 30, 60];

/// Messaging error types
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("not connected")]
    NotConnected,
    #[error("publish timeout")]
    Timeout,
    #[error("client error: {0}")]
    Client(String),
}

/// Per-site topic table.
#[derive(Debug, Clone)]
pub struct Topics {
    site: String,
}

impl Topics {
    pub fn new(site: &str) -> Self {
        Self { site: site.to_string() }
    }

    pub fn telemetry(&self) -> String {
        format!("lifo4/{}/telemetry", self.site)
    }
    pub fn decisions(&self) -> String {
        format!("lifo4/{}/decisions", self.site)
    }
    pub fn alarms(&self) -> String {
        format!("lifo4/{}/alarms", self.site)
    }
    pub fn heartbeat(&self) -> String {
        format!("lifo4/{}/heartbeat", self.site)
    }
    pub fn status(&self) -> String {
        format!("lifo4/{}/status", self.site)
    }
    pub fn commands(&self) -> String {
        format!("lifo4/{}/commands", self.site)
    }
    pub fn config(&self) -> String {
        format!("lifo4/{}/config", self.site)
    }
    pub fn ota_update(&self) -> String {
        format!("lifo4/{}/ota/update", self.site)
    }
    pub fn ota_status(&self) -> String {
        format!("lifo4/{}/ota/status", self.site)
    }
}

/// Inbound events handed to the control loop's command queue.
#[derive(Debug)]
pub enum IngressEvent {
    /// A command arrived on the commands topic
    Command(CloudCommand),
    /// A config message was applied to the cache (cloud contact proof)
    ConfigApplied,
    /// An inbound payload failed schema validation
    ConfigInvalid(String),
}

/// Retained config message published by the cloud on the config topic.
#[derive(Debug, Deserialize)]
struct CloudConfigUpdate {
    #[serde(default)]
    prices: Option<Vec<f64>>,
    #[serde(default)]
    load_forecast: Option<Vec<f64>>,
    #[serde(default)]
    solar_forecast: Option<Vec<f64>>,
    #[serde(default)]
    optimization: Option<OptimizationConfig>,
}

/// Seam between the edge and the broker; the scenario tests run the
/// control loop against an in-memory implementation.
///
/// Contract: QoS-1 traffic goes through `publish_confirmed`; plain
/// `publish` is for QoS-0 best-effort traffic (telemetry, heartbeat).
#[async_trait]
pub trait CloudLink: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;
    async fn publish_confirmed(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;
}

/// Tracks QoS-1 publishes until the broker acknowledges them.
///
/// rumqttc assigns packet ids inside the event loop, in submit order, so
/// the tracker pairs each submitted publish (FIFO) with the next outgoing
/// packet id it sees, then completes it on the matching PUBACK.
#[derive(Default)]
struct AckTracker {
    waiting: Mutex<VecDeque<oneshot::Sender<()>>>,
    inflight: Mutex<HashMap<u16, oneshot::Sender<()>>>,
}

impl AckTracker {
    fn submitted(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().push_back(tx);
        rx
    }

    fn on_outgoing_publish(&self, pkid: u16) {
        if pkid == 0 {
            return; // QoS-0
        }
        if let Some(tx) = self.waiting.lock().pop_front() {
            self.inflight.lock().insert(pkid, tx);
        }
    }

    fn on_puback(&self, pkid: u16) {
        if let Some(tx) = self.inflight.lock().remove(&pkid) {
            let _ = tx.send(());
        }
    }

    fn reset(&self) {
        self.waiting.lock().clear();
        self.inflight.lock().clear();
    }
}

/// MQTT implementation of [`CloudLink`].
pub struct EdgeMqttClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    tracker: Arc<AckTracker>,
    publish_timeout: Duration,
    /// Serializes confirmed publishes so FIFO pkid pairing holds.
    confirm_gate: tokio::sync::Mutex<()>,
}

impl EdgeMqttClient {
    /// Connect and spawn the event-loop task. Inbound messages are routed
    /// into `cache` / `ingress_tx` / `ota_tx`.
    pub fn connect(
        config: &MqttConfig,
        edge_id: &str,
        topics: Topics,
        cache: Arc<CacheManager>,
        ingress_tx: mpsc::Sender<IngressEvent>,
        ota_tx: mpsc::Sender<OtaNotice>,
    ) -> Arc<Self> {
        let last_will_payload = format!(r#"{{"edge_id":"{edge_id}","status":"offline"}}"#);
        let mut options = build_mqtt_options(
            edge_id,
            &config.broker_host,
            config.broker_port,
            &config.cert_dir,
            config.keep_alive_secs,
        );
        options.set_last_will(LastWill::new(
            topics.status(),
            last_will_payload.into_bytes(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let connected = Arc::new(AtomicBool::new(false));
        let tracker = Arc::new(AckTracker::default());

        let link = Arc::new(Self {
            client: client.clone(),
            connected: connected.clone(),
            tracker: tracker.clone(),
            publish_timeout: Duration::from_secs(config.publish_timeout_secs),
            confirm_gate: tokio::sync::Mutex::new(()),
        });

        tokio::spawn(async move {
            let mut attempt: usize = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        attempt = 0;
                        connected.store(true, Ordering::SeqCst);
                        tracing::info!("mqtt connected, re-subscribing");
                        for (topic, qos) in [
                            (topics.commands(), QoS::AtLeastOnce),
                            (topics.config(), QoS::AtLeastOnce),
                            (topics.ota_update(), QoS::AtLeastOnce),
                        ] {
                            if let Err(e) = client.subscribe(&topic, qos).await {
                                tracing::error!("subscribe {topic} failed: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        route_inbound(
                            &topics,
                            &publish.topic,
                            &publish.payload,
                            &cache,
                            &ingress_tx,
                            &ota_tx,
                        )
                        .await;
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        tracker.on_puback(ack.pkid);
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        tracker.on_outgoing_publish(pkid);
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        tracing::info!("mqtt disconnected (shutdown)");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let was_connected = connected.swap(false, Ordering::SeqCst);
                        tracker.reset();
                        if was_connected {
                            tracing::warn!("mqtt connection lost: {e}");
                        }
                        let delay = BACKOFF_SECS[attempt.min(BACKOFF_SECS.len() - 1)];
                        let jitter = rand::thread_rng().gen_range(0..1000);
                        tracing::debug!(
                            attempt,
                            delay_secs = delay,
                            "mqtt reconnect scheduled"
                        );
                        tokio::time::sleep(Duration::from_secs(delay) + Duration::from_millis(jitter))
                            .await;
                        attempt += 1;
                    }
                }
            }
        });

        link
    }

    /// Graceful close: flushes the disconnect packet through the event loop.
    pub async fn shutdown(&self) {
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl CloudLink for EdgeMqttClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| MqttError::Client(e.to_string()))
    }

    async fn publish_confirmed(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        // Hold the gate across submission only, never across the wait for
        // the broker ack.
        let rx = {
            let _gate = self.confirm_gate.lock().await;
            let rx = self.tracker.submitted();
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| MqttError::Client(e.to_string()))?;
            rx
        };
        match tokio::time::timeout(self.publish_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MqttError::NotConnected),
            Err(_) => Err(MqttError::Timeout),
        }
    }
}

/// Topic table: route one inbound message to its handler.
async fn route_inbound(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
    cache: &Arc<CacheManager>,
    ingress_tx: &mpsc::Sender<IngressEvent>,
    ota_tx: &mpsc::Sender<OtaNotice>,
) {
    if topic == topics.commands() {
        match serde_json::from_slice::<CloudCommand>(payload) {
            Ok(command) => {
                let _ = ingress_tx.send(IngressEvent::Command(command)).await;
            }
            Err(e) => {
                let _ = ingress_tx
                    .send(IngressEvent::ConfigInvalid(format!("command: {e}")))
                    .await;
            }
        }
    } else if topic == topics.config() {
        match serde_json::from_slice::<CloudConfigUpdate>(payload) {
            Ok(update) => {
                if let Some(prices) = update.prices {
                    cache.update_prices(&prices);
                }
                if let Some(forecast) = update.load_forecast {
                    cache.update_load_forecast(forecast);
                }
                if let Some(forecast) = update.solar_forecast {
                    cache.update_solar_forecast(forecast);
                }
                if let Some(optimization) = update.optimization {
                    cache.update_optimization_config(optimization);
                }
                let _ = ingress_tx.send(IngressEvent::ConfigApplied).await;
            }
            Err(e) => {
                let _ = ingress_tx
                    .send(IngressEvent::ConfigInvalid(format!("config: {e}")))
                    .await;
            }
        }
    } else if topic == topics.ota_update() {
        match serde_json::from_slice::<OtaNotice>(payload) {
            Ok(notice) => {
                let _ = ota_tx.send(notice).await;
            }
            Err(e) => {
                let _ = ingress_tx
                    .send(IngressEvent::ConfigInvalid(format!("ota notice: {e}")))
                    .await;
            }
        }
    } else {
        tracing::debug!("unhandled topic {topic}");
    }
}

/// Build broker options with mutual TLS when the cert directory is
/// populated; falls back to plain TCP with a warning (dev brokers).
pub fn build_mqtt_options(
    client_id: &str,
    host: &str,
    port: u16,
    cert_dir: &Path,
    keep_alive_secs: u64,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(keep_alive_secs));
    options.set_clean_session(false);

    let ca = std::fs::read(cert_dir.join("ca.crt"));
    let cert = std::fs::read(cert_dir.join("client.crt"));
    let key = std::fs::read(cert_dir.join("client.key"));
    match (ca, cert, key) {
        (Ok(ca), Ok(cert), Ok(key)) => {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            }));
        }
        _ => {
            tracing::warn!(
                "client certificates not found in {}, using plain MQTT (dev only)",
                cert_dir.display()
            );
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_table() {
        let topics = Topics::new("site-042");
        assert_eq!(topics.telemetry(), "lifo4/site-042/telemetry");
        assert_eq!(topics.commands(), "lifo4/site-042/commands");
        assert_eq!(topics.ota_update(), "lifo4/site-042/ota/update");
        assert_eq!(topics.ota_status(), "lifo4/site-042/ota/status");
    }

    #[test]
    fn test_ack_tracker_pairs_fifo() {
        let tracker = AckTracker::default();
        let mut rx1 = tracker.submitted();
        let mut rx2 = tracker.submitted();

        tracker.on_outgoing_publish(7);
        tracker.on_outgoing_publish(8);

        tracker.on_puback(8);
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());

        tracker.on_puback(7);
        assert!(rx1.try_recv().is_ok());
    }

    #[test]
    fn test_ack_tracker_ignores_qos0() {
        let tracker = AckTracker::default();
        let _rx = tracker.submitted();
        tracker.on_outgoing_publish(0);
        assert_eq!(tracker.waiting.lock().len(), 1);
        assert!(tracker.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_route_inbound_command() {
        let topics = Topics::new("s1");
        let cache = Arc::new(CacheManager::new(OptimizationConfig::default()));
        let (ingress_tx, mut ingress_rx) = mpsc::channel(8);
        let (ota_tx, _ota_rx) = mpsc::channel(8);

        let payload = br#"{"action":"CHARGE","power_kw":30.0,"reason":"test"}"#;
        route_inbound(&topics, "lifo4/s1/commands", payload, &cache, &ingress_tx, &ota_tx).await;

        match ingress_rx.recv().await.unwrap() {
            IngressEvent::Command(command) => {
                assert_eq!(command.action, "CHARGE");
                assert_eq!(command.power_kw, 30.0);
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_inbound_config_updates_cache() {
        let topics = Topics::new("s1");
        let cache = Arc::new(CacheManager::new(OptimizationConfig::default()));
        let (ingress_tx, mut ingress_rx) = mpsc::channel(8);
        let (ota_tx, _ota_rx) = mpsc::channel(8);

        let prices: Vec<f64> = vec![0.42; 24];
        let payload = serde_json::to_vec(&serde_json::json!({ "prices": prices })).unwrap();
        route_inbound(&topics, "lifo4/s1/config", &payload, &cache, &ingress_tx, &ota_tx).await;

        assert!(matches!(
            ingress_rx.recv().await.unwrap(),
            IngressEvent::ConfigApplied
        ));
        assert_eq!(cache.snapshot().prices[0], 0.42);
    }

    #[tokio::test]
    async fn test_route_inbound_bad_payload_reports_invalid() {
        let topics = Topics::new("s1");
        let cache = Arc::new(CacheManager::new(OptimizationConfig::default()));
        let (ingress_tx, mut ingress_rx) = mpsc::channel(8);
        let (ota_tx, _ota_rx) = mpsc::channel(8);

        route_inbound(&topics, "lifo4/s1/commands", b"not json", &cache, &ingress_tx, &ota_tx)
            .await;
        assert!(matches!(
            ingress_rx.recv().await.unwrap(),
            IngressEvent::ConfigInvalid(_)
        ));
    }
}
