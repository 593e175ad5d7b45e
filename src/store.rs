//! Local Store
//!
//! Single-file SQLite database holding telemetry, decisions, alarms, and
//! the outbound cloud-sync queue. Single writer, many readers: every
//! mutation goes through one connection behind a lock, and readers get a
//! consistent point-in-time view (WAL mode).
//!
//! Queue contract: `enqueue` is durable before it returns; rows are deleted
//! only by `ack` (after broker confirmation) or by queue retention expiry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::alarm::Alarm;
use crate::engine::Decision;
use crate::fieldbus::TelemetrySnapshot;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("disk full")]
    DiskFull,
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// True when SQLite reported an out-of-space condition.
    pub fn is_disk_full(&self) -> bool {
        match self {
            StoreError::DiskFull => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == ErrorCode::DiskFull
            }
            _ => false,
        }
    }
}

/// A message waiting for delivery to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Retention policy applied by `cleanup`.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub telemetry_hours: i64,
    pub decisions_days: i64,
    pub alarms_days: i64,
    pub queue_days: i64,
}

impl RetentionPolicy {
    /// Emergency cut applied under disk pressure: keep only the freshest
    /// slice of history. Queue rows keep their own retention.
    pub fn aggressive(self) -> Self {
        Self {
            telemetry_hours: self.telemetry_hours.min(24),
            decisions_days: self.decisions_days.min(7),
            alarms_days: self.alarms_days.min(30),
            queue_days: self.queue_days,
        }
    }
}

/// Durable local store
pub struct Store {
    conn: Mutex<Connection>,
    path: std::path::PathBuf,
}

impl Store {
    /// Open (or create) the store file and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: std::path::PathBuf::from(":memory:"),
        })
    }
    pub fn save_telemetry(&self, snapshot: &TelemetrySnapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_string(snapshot)?;
        self.conn.lock().execute(
            "INSERT INTO telemetry (captured_at, payload) VALUES (?1, ?2)",
            params![snapshot.captured_at.to_rfc3339(), payload],
        )?;
        Ok(())
    }

    pub fn save_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let payload = serde_json::to_string(decision)?;
        self.conn.lock().execute(
            "INSERT INTO decisions (issued_at, payload) VALUES (?1, ?2)",
            params![decision.issued_at.to_rfc3339(), payload],
        )?;
        Ok(())
    }

    pub fn save_alarm(&self, alarm: &Alarm) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alarms (raised_at, severity, kind, message, metadata, acknowledged)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                alarm.raised_at.to_rfc3339(),
                alarm.severity.as_str(),
                alarm.kind,
                alarm.message,
                serde_json::to_string(&alarm.metadata)?,
                alarm.acknowledged as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark an alarm acknowledged. Unknown ids are a no-op.
    pub fn acknowledge_alarm(&self, id: i64) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "UPDATE alarms SET acknowledged = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// True if an unacknowledged CRITICAL/EMERGENCY alarm was raised in the
    /// last 24 hours (input to the OTA safety gate).
    pub fn active_critical_alarm(&self) -> Result<bool, StoreError> {
        let since = (Utc::now() - ChronoDuration::hours(24)).to_rfc3339();
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM alarms
             WHERE acknowledged = 0 AND raised_at >= ?1
               AND severity IN ('CRITICAL', 'EMERGENCY')",
            params![since],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Durably append a message to the outbound queue. The row is committed
    /// before this returns.
    pub fn enqueue(&self, topic: &str, payload: &[u8], qos: u8) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO outbound_queue (topic, payload, qos, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![topic, payload, qos, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pop up to `max_n` deliverable messages in FIFO order. Rows are not
    /// deleted: each gets an attempt count bump and a redelivery hold-off so
    /// a crashed drain hands them back later.
    pub fn pop_batch(&self, max_n: u32) -> Result<Vec<QueuedMessage>, StoreError> {
        let now = Utc::now();
        let holdoff = (now + ChronoDuration::seconds(30)).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, topic, payload, qos, enqueued_at, attempts, next_attempt_at
             FROM outbound_queue
             WHERE next_attempt_at IS NULL OR next_attempt_at <= ?1
             ORDER BY id ASC LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![now.to_rfc3339(), max_n], |row| {
                Ok(QueuedMessage {
                    id: row.get(0)?,
                    topic: row.get(1)?,
                    payload: row.get(2)?,
                    qos: row.get::<_, i64>(3)? as u8,
                    enqueued_at: parse_ts(&row.get::<_, String>(4)?),
                    attempts: row.get::<_, i64>(5)? as u32,
                    next_attempt_at: row
                        .get::<_, Option<String>>(6)?
                        .map(|s| parse_ts(&s)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for message in &messages {
            conn.execute(
                "UPDATE outbound_queue SET attempts = attempts + 1, next_attempt_at = ?1 WHERE id = ?2",
                params![holdoff, message.id],
            )?;
        }
        Ok(messages)
    }

    /// Delete a delivered message. Idempotent: acking twice succeeds.
    pub fn ack(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM outbound_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn queue_depth(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM outbound_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Apply the retention policy. Never touches un-acked queue rows inside
    /// their own retention window.
    pub fn cleanup(&self, policy: RetentionPolicy) -> Result<(), StoreError> {
        let now = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM telemetry WHERE captured_at < ?1",
            params![(now - ChronoDuration::hours(policy.telemetry_hours)).to_rfc3339()],
        )?;
        conn.execute(
            "DELETE FROM decisions WHERE issued_at < ?1",
            params![(now - ChronoDuration::days(policy.decisions_days)).to_rfc3339()],
        )?;
        // Acknowledged alarms age out at the configured retention;
        // unacknowledged ones get double the window before expiring.
        conn.execute(
            "DELETE FROM alarms WHERE acknowledged = 1 AND raised_at < ?1",
            params![(now - ChronoDuration::days(policy.alarms_days)).to_rfc3339()],
        )?;
        conn.execute(
            "DELETE FROM alarms WHERE raised_at < ?1",
            params![(now - ChronoDuration::days(policy.alarms_days * 2)).to_rfc3339()],
        )?;
        // Queue retention expiry is the only path besides `ack` that removes
        // a queue row.
        conn.execute(
            "DELETE FROM outbound_queue WHERE enqueued_at < ?1",
            params![(now - ChronoDuration::days(policy.queue_days)).to_rfc3339()],
        )?;
        Ok(())
    }

    /// Reclaim file space after an aggressive cut.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.conn.lock().execute_batch("VACUUM")?;
        Ok(())
    }

    /// Current size of the store file (0 for in-memory).
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Latest persisted telemetry row, if any.
    pub fn latest_telemetry(&self) -> Result<Option<TelemetrySnapshot>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT payload FROM telemetry ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS telemetry (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             captured_at TEXT NOT NULL,
             payload TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_telemetry_captured ON telemetry (captured_at);
         CREATE TABLE IF NOT EXISTS decisions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             issued_at TEXT NOT NULL,
             payload TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS alarms (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             raised_at TEXT NOT NULL,
             severity TEXT NOT NULL,
             kind TEXT NOT NULL,
             message TEXT NOT NULL,
             metadata TEXT,
             acknowledged INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS outbound_queue (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             topic TEXT NOT NULL,
             payload BLOB NOT NULL,
             qos INTEGER NOT NULL,
             enqueued_at TEXT NOT NULL,
             attempts INTEGER NOT NULL DEFAULT 0,
             next_attempt_at TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_queue_order ON outbound_queue (id);",
    )
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{kinds, Severity};
    use crate::engine::{Decision, DecisionAction, DecisionPriority, OperatingMode};
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

    #[test]
    fn test_enqueue_pop_ack_cycle() {
        let store = Store::open_in_memory().unwrap();
        let id1 = store.enqueue("lifo4/s1/decisions", b"{\"a\":1}", 1).unwrap();
        let id2 = store.enqueue("lifo4/s1/decisions", b"{\"a\":2}", 1).unwrap();
        assert!(id2 > id1);

        let batch = store.pop_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        // FIFO order
        assert_eq!(batch[0].id, id1);
        assert_eq!(batch[1].id, id2);
        assert_eq!(batch[0].attempts, 0);

        // Popped but unacked rows are held back from the next pop
        assert!(store.pop_batch(10).unwrap().is_empty());

        store.ack(id1).unwrap();
        store.ack(id1).unwrap(); // idempotent
        assert_eq!(store.queue_depth().unwrap(), 1);
    }

    #[test]
    fn test_cleanup_preserves_unacked_queue_rows() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue("lifo4/s1/alarms", b"{}", 1).unwrap();
        let policy = RetentionPolicy {
            telemetry_hours: 72,
            decisions_days: 30,
            alarms_days: 90,
            queue_days: 7,
        };
        store.cleanup(policy.aggressive()).unwrap();
        assert_eq!(store.queue_depth().unwrap(), 1);
    }

    #[test]
    fn test_telemetry_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.latest_telemetry().unwrap().is_none());
        store.save_telemetry(&snapshot()).unwrap();
        let latest = store.latest_telemetry().unwrap().unwrap();
        assert_eq!(latest.soc, 50.0);
    }

    #[test]
    fn test_decision_persist() {
        let store = Store::open_in_memory().unwrap();
        let decision = Decision {
            action: DecisionAction::Charge,
            power_kw: 30.0,
            priority: DecisionPriority::Economic,
            reason: "cloud setpoint".into(),
            mode: OperatingMode::Online,
            issued_at: Utc::now(),
        };
        store.save_decision(&decision).unwrap();
    }

    #[test]
    fn test_alarm_ack_and_critical_flag() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.active_critical_alarm().unwrap());

        let id = store
            .save_alarm(&Alarm::new(
                Severity::Critical,
                kinds::SAFETY_EMERGENCY_STOP,
                "temp over limit",
            ))
            .unwrap();
        assert!(store.active_critical_alarm().unwrap());

        store.acknowledge_alarm(id).unwrap();
        assert!(!store.active_critical_alarm().unwrap());
    }

    #[test]
    fn test_durable_on_disk_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.db");
        {
            let store = Store::open(&path).unwrap();
            store.enqueue("lifo4/s1/decisions", b"{}", 1).unwrap();
        }
        // Reopen: the row survived the first handle.
        let store = Store::open(&path).unwrap();
        assert_eq!(store.queue_depth().unwrap(), 1);
        assert!(store.size_bytes() > 0);
    }
}
