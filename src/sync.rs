//! Sync Manager
//!
//! Keeps the cloud consistent without ever stalling the control loop. While
//! the link is up, each cycle publishes the freshest telemetry best-effort
//! and drains a bounded batch from the outbound queue; queue rows are acked
//! in the store only after the broker confirms delivery. While the link is
//! down, the control loop enqueues instead, and telemetry is down-sampled
//! once the queue passes its soft limit; alarms and decisions never are.

use std::sync::Arc;

use crate::fieldbus::TelemetrySnapshot;
use crate::mqtt::{CloudLink, Topics};
use crate::store::{Store, StoreError};

/// Messages republished per drain step.
const DRAIN_BATCH: u32 = 20;

pub struct SyncManager<L: CloudLink> {
    store: Arc<Store>,
    link: Arc<L>,
    topics: Topics,
    queue_soft_limit: u64,
    downsample_keep_1_in: u64,
    telemetry_seq: u64,
}

impl<L: CloudLink> SyncManager<L> {
    pub fn new(
        store: Arc<Store>,
        link: Arc<L>,
        topics: Topics,
        queue_soft_limit: u64,
        downsample_keep_1_in: u64,
    ) -> Self {
        Self {
            store,
            link,
            topics,
            queue_soft_limit,
            downsample_keep_1_in: downsample_keep_1_in.max(1),
            telemetry_seq: 0,
        }
    }

    /// One sync step, called at the tail of a connected cycle.
    pub async fn step(&mut self, snapshot: &TelemetrySnapshot) {
        if !self.link.is_connected() {
            return;
        }

        // Freshest sample first, best effort (QoS-0).
        match serde_json::to_vec(snapshot) {
            Ok(payload) => {
                if let Err(e) = self.link.publish(&self.topics.telemetry(), payload).await {
                    tracing::debug!("telemetry publish skipped: {e}");
                }
            }
            Err(e) => tracing::error!("telemetry serialization failed: {e}"),
        }

        self.drain().await;
    }

    /// Republish up to one batch of queued messages. Stops at the first
    /// delivery failure; unacked rows come back on a later drain.
    pub async fn drain(&self) -> usize {
        let batch = match self.store.pop_batch(DRAIN_BATCH) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("queue pop failed: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for message in batch {
            match self
                .link
                .publish_confirmed(&message.topic, message.payload.clone())
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.store.ack(message.id) {
                        tracing::error!("ack {} failed: {e}", message.id);
                        break;
                    }
                    delivered += 1;
                }
                Err(e) => {
                    tracing::debug!(
                        "drain stopped at message {} (attempt {}): {e}",
                        message.id,
                        message.attempts
                    );
                    break;
                }
            }
        }
        if delivered > 0 {
            tracing::debug!("drained {delivered} queued messages");
        }
        delivered
    }

    /// Queue a telemetry sample for later sync. Above the soft limit only
    /// one in K samples is kept. Returns whether the sample was enqueued.
    pub fn enqueue_telemetry(&mut self, snapshot: &TelemetrySnapshot) -> Result<bool, StoreError> {
        self.telemetry_seq += 1;
        let depth = self.store.queue_depth()?;
        if depth >= self.queue_soft_limit && self.telemetry_seq % self.downsample_keep_1_in != 0 {
            return Ok(false);
        }
        let payload = serde_json::to_vec(snapshot)?;
        self.store.enqueue(&self.topics.telemetry(), &payload, 0)?;
        Ok(true)
    }

    /// Decisions are never down-sampled.
    pub fn enqueue_decision(&self, payload: &[u8]) -> Result<(), StoreError> {
        self.store.enqueue(&self.topics.decisions(), payload, 1)?;
        Ok(())
    }

    /// Alarms are never down-sampled.
    pub fn enqueue_alarm(&self, payload: &[u8]) -> Result<(), StoreError> {
        self.store.enqueue(&self.topics.alarms(), payload, 1)?;
        Ok(())
    }
}
