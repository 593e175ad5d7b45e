//! Field Bus Client
//!
//! Request-reply Modbus-TCP link to the BMS/PCS. Register and coil layouts
//! are data (`RegisterMap`), not code: the same client drives any BMS
//! variant whose map is described by a table entry per logical name.
//!
//! The client performs no retries of its own; the Self-Healing Manager
//! owns the retry schedule. It holds no persistent state beyond the TCP
//! connection and is safe to recreate at any time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::FieldBusConfig;

/// Field bus error categories
#[derive(Debug, Error)]
pub enum FieldBusError {
    #[error("bus timeout: {0}")]
    Timeout(String),
    #[error("frame integrity error: {0}")]
    Crc(String),
    #[error("device exception code {0:#04x}")]
    ExceptionCode(u8),
    #[error("request refused: {0}")]
    Refused(String),
}

/// Immutable telemetry sample captured once per tick.
///
/// A snapshot either carries every required reading or does not exist:
/// any unreadable sensor rejects the whole sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub soc: f64,
    pub soh: f64,
    pub pack_voltage: f64,
    /// Signed; positive = discharge
    pub current: f64,
    pub power_kw: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub temp_avg: f64,
    pub grid_frequency: f64,
    pub grid_voltage: f64,
    pub cell_voltage_min: f64,
    pub cell_voltage_max: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub insulation_resistance_kohm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub smoke_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gas_ppm: Option<f64>,
    pub captured_at: DateTime<Utc>,
    #[serde(skip, default = "Instant::now")]
    pub captured_mono: Instant,
}

impl TelemetrySnapshot {
    /// All numeric readings must be finite; a NaN/∞ anywhere rejects the
    /// sample before it can propagate.
    pub fn validate(&self) -> Result<(), FieldBusError> {
        let required = [
            self.soc,
            self.soh,
            self.pack_voltage,
            self.current,
            self.power_kw,
            self.temp_min,
            self.temp_max,
            self.temp_avg,
            self.grid_frequency,
            self.grid_voltage,
            self.cell_voltage_min,
            self.cell_voltage_max,
        ];
        let optional = [self.insulation_resistance_kohm, self.smoke_level, self.gas_ppm];
        if required.iter().any(|v| !v.is_finite())
            || optional.iter().flatten().any(|v| !v.is_finite())
        {
            return Err(FieldBusError::Crc("non-finite reading in snapshot".into()));
        }
        Ok(())
    }
}

/// Logical write targets accepted by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteTarget {
    PowerSetpoint,
    ChargeEnable,
    DischargeEnable,
    EmergencyStopCoil,
}

impl WriteTarget {
    pub fn key(&self) -> &'static str {
        match self {
            WriteTarget::PowerSetpoint => "power_setpoint",
            WriteTarget::ChargeEnable => "charge_enable",
            WriteTarget::DischargeEnable => "discharge_enable",
            WriteTarget::EmergencyStopCoil => "emergency_stop_coil",
        }
    }
}

/// Register value encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    U16,
    U32,
    Coil,
}

/// One register/coil map entry: logical name → physical layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub address: u16,
    pub count: u16,
    pub scale: f64,
    pub offset: f64,
    pub signed: bool,
    pub encoding: Encoding,
}

impl RegisterSpec {
    fn reg(address: u16, scale: f64, signed: bool) -> Self {
        Self { address, count: 1, scale, offset: 0.0, signed, encoding: Encoding::U16 }
    }

    fn coil(address: u16) -> Self {
        Self { address, count: 1, scale: 1.0, offset: 0.0, signed: false, encoding: Encoding::Coil }
    }

    fn decode(&self, words: &[u16]) -> f64 {
        let raw: i64 = match self.encoding {
            Encoding::U16 | Encoding::Coil => {
                let v = words[0] as i64;
                if self.signed && v > 0x7FFF {
                    v - 0x1_0000
                } else {
                    v
                }
            }
            Encoding::U32 => {
                let v = ((words[0] as i64) << 16) | words[1] as i64;
                if self.signed && v > 0x7FFF_FFFF {
                    v - 0x1_0000_0000
                } else {
                    v
                }
            }
        };
        raw as f64 * self.scale + self.offset
    }

    fn encode(&self, value: f64) -> Result<u16, FieldBusError> {
        let raw = ((value - self.offset) / self.scale).round();
        if self.signed {
            if !(-32768.0..=32767.0).contains(&raw) {
                return Err(FieldBusError::Refused(format!("value {value} out of range")));
            }
            Ok((raw as i16) as u16)
        } else {
            if !(0.0..=65535.0).contains(&raw) {
                return Err(FieldBusError::Refused(format!("value {value} out of range")));
            }
            Ok(raw as u16)
        }
    }
}

/// Register map: the full logical layout for one BMS variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMap {
    pub reads: HashMap<String, RegisterSpec>,
    pub writes: HashMap<String, RegisterSpec>,
}

/// Snapshot fields every map must provide. Optional sensor channels
/// (insulation, smoke, gas) are read only when the map declares them.
const REQUIRED_READS: [&str; 12] = [
    "soc",
    "soh",
    "pack_voltage",
    "current",
    "power_kw",
    "temp_min",
    "temp_max",
    "temp_avg",
    "grid_frequency",
    "grid_voltage",
    "cell_voltage_min",
    "cell_voltage_max",
];

impl RegisterMap {
    /// Required entries the map is missing (a healthy map returns empty).
    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_READS
            .iter()
            .copied()
            .filter(|name| !self.reads.contains_key(*name))
            .collect()
    }

    /// Look up a named variant. Unknown names fall back to the default
    /// layout so a half-provisioned device can still read its pack.
    pub fn by_name(name: &str) -> Self {
        match name {
            "default" | "" => Self::default_bess(),
            other => {
                tracing::warn!("unknown register map variant '{}', using default", other);
                Self::default_bess()
            }
        }
    }

    /// Default BESS layout (16-bit words, Daly-style scaling).
    pub fn default_bess() -> Self {
        let mut reads = HashMap::new();
        reads.insert("pack_voltage".into(), RegisterSpec::reg(0x0000, 0.1, false));
        reads.insert("current".into(), RegisterSpec::reg(0x0001, 0.1, true));
        reads.insert("soc".into(), RegisterSpec::reg(0x0002, 0.1, false));
        reads.insert("soh".into(), RegisterSpec::reg(0x0003, 0.1, false));
        reads.insert("power_kw".into(), RegisterSpec::reg(0x0004, 0.1, true));
        reads.insert("temp_min".into(), RegisterSpec::reg(0x0010, 0.1, true));
        reads.insert("temp_max".into(), RegisterSpec::reg(0x0011, 0.1, true));
        reads.insert("temp_avg".into(), RegisterSpec::reg(0x0012, 0.1, true));
        reads.insert("grid_frequency".into(), RegisterSpec::reg(0x0020, 0.01, false));
        reads.insert("grid_voltage".into(), RegisterSpec::reg(0x0021, 0.1, false));
        reads.insert("cell_voltage_min".into(), RegisterSpec::reg(0x0030, 0.001, false));
        reads.insert("cell_voltage_max".into(), RegisterSpec::reg(0x0031, 0.001, false));
        reads.insert("insulation_resistance_kohm".into(), RegisterSpec::reg(0x0040, 1.0, false));

        let mut writes = HashMap::new();
        writes.insert("power_setpoint".into(), RegisterSpec::reg(0x0080, 0.1, true));
        writes.insert("charge_enable".into(), RegisterSpec::coil(0x0090));
        writes.insert("discharge_enable".into(), RegisterSpec::coil(0x0091));
        writes.insert("emergency_stop_coil".into(), RegisterSpec::coil(0x00A0));

        Self { reads, writes }
    }
}

/// Seam between the control loop and the physical bus; the scenario tests
/// drive the loop through a mock implementation.
#[async_trait]
pub trait FieldBus: Send + Sync {
    async fn read_telemetry(&self) -> Result<TelemetrySnapshot, FieldBusError>;
    async fn write(&self, target: WriteTarget, value: f64) -> Result<(), FieldBusError>;
    /// Shortest-path stop: reduced deadline, single coil write.
    async fn emergency_stop(&self) -> Result<(), FieldBusError>;
    /// Discovery probe for one unit address.
    async fn probe(&self, unit_id: u8) -> bool;
}

/// Modbus-TCP implementation of [`FieldBus`].
pub struct ModbusFieldBus {
    config: FieldBusConfig,
    map: RegisterMap,
    conn: Mutex<Option<TcpStream>>,
    transaction_id: AtomicU16,
}

impl ModbusFieldBus {
    pub fn new(config: FieldBusConfig) -> Self {
        let map = RegisterMap::by_name(&config.register_map);
        Self::with_map(config, map)
    }

    pub fn with_map(config: FieldBusConfig, map: RegisterMap) -> Self {
        for name in map.missing_required() {
            tracing::error!("register map lacks required entry '{}'", name);
        }
        Self {
            config,
            map,
            conn: Mutex::new(None),
            transaction_id: AtomicU16::new(1),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn connect(&self) -> Result<TcpStream, FieldBusError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let connect = TcpStream::connect(&addr);
        match tokio::time::timeout(self.timeout(), connect).await {
            Ok(Ok(stream)) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| FieldBusError::Refused(e.to_string()))?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(FieldBusError::Refused(format!("connect {addr}: {e}"))),
            Err(_) => Err(FieldBusError::Timeout(format!("connect {addr}"))),
        }
    }

    /// One MBAP request-reply exchange. Any error drops the connection so
    /// the next call starts clean.
    async fn transact(
        &self,
        unit_id: u8,
        pdu: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, FieldBusError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }

        let tid = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&[0, 0]); // protocol id
        frame.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
        frame.push(unit_id);
        frame.extend_from_slice(pdu);

        // The exchange borrows the stream inside this block only, so the
        // error paths below can drop the connection.
        let outcome: Result<(Vec<u8>, [u8; 7]), Option<std::io::Error>> = {
            match guard.as_mut() {
                Some(stream) => {
                    let exchange = async {
                        stream.write_all(&frame).await?;
                        let mut header = [0u8; 7];
                        stream.read_exact(&mut header).await?;
                        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
                        let mut body = vec![0u8; len.saturating_sub(1)];
                        stream.read_exact(&mut body).await?;
                        Ok::<(Vec<u8>, [u8; 7]), std::io::Error>((body, header))
                    };
                    match tokio::time::timeout(deadline, exchange).await {
                        Ok(Ok(reply)) => Ok(reply),
                        Ok(Err(e)) => Err(Some(e)),
                        Err(_) => Err(None),
                    }
                }
                None => Err(Some(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no connection",
                ))),
            }
        };

        let (body, header) = match outcome {
            Ok(reply) => reply,
            Err(Some(e)) => {
                *guard = None;
                return Err(FieldBusError::Refused(e.to_string()));
            }
            Err(None) => {
                *guard = None;
                return Err(FieldBusError::Timeout(format!(
                    "unit {unit_id} fc {:#04x}",
                    pdu.first().copied().unwrap_or(0)
                )));
            }
        };

        let reply_tid = u16::from_be_bytes([header[0], header[1]]);
        if reply_tid != tid || body.is_empty() {
            *guard = None;
            return Err(FieldBusError::Crc(format!(
                "transaction mismatch: sent {tid}, got {reply_tid}"
            )));
        }

        let function = body[0];
        if function & 0x80 != 0 {
            let code = body.get(1).copied().unwrap_or(0);
            return Err(FieldBusError::ExceptionCode(code));
        }
        if function != pdu[0] {
            *guard = None;
            return Err(FieldBusError::Crc(format!(
                "function mismatch: sent {:#04x}, got {function:#04x}",
                pdu[0]
            )));
        }
        Ok(body)
    }

    async fn read_words(
        &self,
        unit_id: u8,
        spec: &RegisterSpec,
        deadline: Duration,
    ) -> Result<Vec<u16>, FieldBusError> {
        let mut pdu = vec![0x03];
        pdu.extend_from_slice(&spec.address.to_be_bytes());
        pdu.extend_from_slice(&spec.count.to_be_bytes());
        let body = self.transact(unit_id, &pdu, deadline).await?;
        let byte_count = body.get(1).copied().unwrap_or(0) as usize;
        if body.len() < 2 + byte_count || byte_count != spec.count as usize * 2 {
            return Err(FieldBusError::Crc("short register reply".into()));
        }
        Ok(body[2..2 + byte_count]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    async fn read_field(&self, name: &str, deadline: Duration) -> Result<f64, FieldBusError> {
        let spec = self
            .map
            .reads
            .get(name)
            .ok_or_else(|| FieldBusError::Refused(format!("no register map entry for {name}")))?;
        let words = self.read_words(self.config.unit_id, spec, deadline).await?;
        Ok(spec.decode(&words))
    }

    async fn write_spec(
        &self,
        spec: &RegisterSpec,
        value: f64,
        deadline: Duration,
    ) -> Result<(), FieldBusError> {
        let pdu = match spec.encoding {
            Encoding::Coil => {
                let state: u16 = if value != 0.0 { 0xFF00 } else { 0x0000 };
                let mut pdu = vec![0x05];
                pdu.extend_from_slice(&spec.address.to_be_bytes());
                pdu.extend_from_slice(&state.to_be_bytes());
                pdu
            }
            _ => {
                let raw = spec.encode(value)?;
                let mut pdu = vec![0x06];
                pdu.extend_from_slice(&spec.address.to_be_bytes());
                pdu.extend_from_slice(&raw.to_be_bytes());
                pdu
            }
        };
        self.transact(self.config.unit_id, &pdu, deadline).await?;
        Ok(())
    }
}

#[async_trait]
impl FieldBus for ModbusFieldBus {
    async fn read_telemetry(&self) -> Result<TelemetrySnapshot, FieldBusError> {
        let deadline = self.timeout();

        // Required channels: a single failed read rejects the snapshot.
        let soc = self.read_field("soc", deadline).await?;
        let soh = self.read_field("soh", deadline).await?;
        let pack_voltage = self.read_field("pack_voltage", deadline).await?;
        let current = self.read_field("current", deadline).await?;
        let power_kw = self.read_field("power_kw", deadline).await?;
        let temp_min = self.read_field("temp_min", deadline).await?;
        let temp_max = self.read_field("temp_max", deadline).await?;
        let temp_avg = self.read_field("temp_avg", deadline).await?;
        let grid_frequency = self.read_field("grid_frequency", deadline).await?;
        let grid_voltage = self.read_field("grid_voltage", deadline).await?;
        let cell_voltage_min = self.read_field("cell_voltage_min", deadline).await?;
        let cell_voltage_max = self.read_field("cell_voltage_max", deadline).await?;

        // Optional sensor channels, present only if mapped.
        let mut insulation = None;
        if self.map.reads.contains_key("insulation_resistance_kohm") {
            insulation = Some(self.read_field("insulation_resistance_kohm", deadline).await?);
        }
        let mut smoke = None;
        if self.map.reads.contains_key("smoke_level") {
            smoke = Some(self.read_field("smoke_level", deadline).await?);
        }
        let mut gas = None;
        if self.map.reads.contains_key("gas_ppm") {
            gas = Some(self.read_field("gas_ppm", deadline).await?);
        }

        let snapshot = TelemetrySnapshot {
            soc,
            soh,
            pack_voltage,
            current,
            power_kw,
            temp_min,
            temp_max,
            temp_avg,
            grid_frequency,
            grid_voltage,
            cell_voltage_min,
            cell_voltage_max,
            insulation_resistance_kohm: insulation,
            smoke_level: smoke,
            gas_ppm: gas,
            captured_at: Utc::now(),
            captured_mono: Instant::now(),
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    async fn write(&self, target: WriteTarget, value: f64) -> Result<(), FieldBusError> {
        let spec = self
            .map
            .writes
            .get(target.key())
            .ok_or_else(|| FieldBusError::Refused(format!("no map entry for {}", target.key())))?
            .clone();
        self.write_spec(&spec, value, self.timeout()).await
    }

    async fn emergency_stop(&self) -> Result<(), FieldBusError> {
        let spec = self
            .map
            .writes
            .get(WriteTarget::EmergencyStopCoil.key())
            .ok_or_else(|| FieldBusError::Refused("no emergency stop coil mapped".into()))?
            .clone();
        // Half the normal deadline: the stop must not queue behind a slow
        // register exchange.
        let deadline = self.timeout() / 2;
        self.write_spec(&spec, 1.0, deadline).await
    }

    async fn probe(&self, unit_id: u8) -> bool {
        let spec = RegisterSpec::reg(0x0000, 1.0, false);
        self.read_words(unit_id, &spec, self.timeout()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_decode_signed_register() {
        let spec = RegisterSpec::reg(0, 0.1, true);
        assert_eq!(spec.decode(&[0xFFF6]), -1.0); // -10 raw * 0.1
        assert_eq!(spec.decode(&[100]), 10.0);
    }

    #[test]
    fn test_decode_with_offset() {
        let spec = RegisterSpec {
            address: 0,
            count: 1,
            scale: 1.0,
            offset: -40.0,
            signed: false,
            encoding: Encoding::U16,
        };
        assert_eq!(spec.decode(&[65]), 25.0);
    }

    #[test]
    fn test_encode_round_trips() {
        let spec = RegisterSpec::reg(0, 0.1, true);
        let raw = spec.encode(-12.5).unwrap();
        assert_eq!(spec.decode(&[raw]), -12.5);
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let spec = RegisterSpec::reg(0, 0.1, true);
        assert!(matches!(
            spec.encode(1e9),
            Err(FieldBusError::Refused(_))
        ));
    }

    #[test]
    fn test_snapshot_rejects_non_finite() {
        let mut snapshot = snapshot_fixture();
        snapshot.temp_max = f64::NAN;
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_default_map_covers_required_fields() {
        let map = RegisterMap::default_bess();
        for name in REQUIRED_READS {
            assert!(map.reads.contains_key(name), "missing {name}");
        }
        for target in [
            WriteTarget::PowerSetpoint,
            WriteTarget::ChargeEnable,
            WriteTarget::DischargeEnable,
            WriteTarget::EmergencyStopCoil,
        ] {
            assert!(map.writes.contains_key(target.key()), "missing {}", target.key());
        }
    }

    fn snapshot_fixture() -> TelemetrySnapshot {
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

    /// Minimal Modbus-TCP responder: answers every holding-register read
    /// with `raw`, echoes writes, and can serve one exception code.
    async fn spawn_responder(raw: u16, exception: Option<u8>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let mut header = [0u8; 7];
                if stream.read_exact(&mut header).await.is_err() {
                    return;
                }
                let len = u16::from_be_bytes([header[4], header[5]]) as usize;
                let mut body = vec![0u8; len - 1];
                if stream.read_exact(&mut body).await.is_err() {
                    return;
                }
                let function = body[0];
                let reply_pdu: Vec<u8> = if let Some(code) = exception {
                    vec![function | 0x80, code]
                } else {
                    match function {
                        0x03 => {
                            let count = u16::from_be_bytes([body[3], body[4]]);
                            let mut pdu = vec![0x03, (count * 2) as u8];
                            for _ in 0..count {
                                pdu.extend_from_slice(&raw.to_be_bytes());
                            }
                            pdu
                        }
                        // Echo for writes (0x05 / 0x06)
                        _ => body.clone(),
                    }
                };
                let mut reply = Vec::new();
                reply.extend_from_slice(&header[0..2]);
                reply.extend_from_slice(&[0, 0]);
                reply.extend_from_slice(&((reply_pdu.len() as u16 + 1).to_be_bytes()));
                reply.push(header[6]);
                reply.extend_from_slice(&reply_pdu);
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        });
        addr
    }

    fn bus_config(addr: std::net::SocketAddr) -> FieldBusConfig {
        FieldBusConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..FieldBusConfig::default()
        }
    }

    #[tokio::test]
    async fn test_read_telemetry_against_responder() {
        let addr = spawn_responder(500, None).await;
        let bus = ModbusFieldBus::new(bus_config(addr));

        let snapshot = bus.read_telemetry().await.unwrap();
        // raw 500 through each entry's scaling
        assert_eq!(snapshot.soc, 50.0);
        assert_eq!(snapshot.grid_frequency, 5.0);
        assert_eq!(snapshot.cell_voltage_min, 0.5);
        snapshot.validate().unwrap();
    }

    #[tokio::test]
    async fn test_write_and_emergency_stop() {
        let addr = spawn_responder(0, None).await;
        let bus = ModbusFieldBus::new(bus_config(addr));

        bus.write(WriteTarget::PowerSetpoint, 30.0).await.unwrap();
        bus.write(WriteTarget::ChargeEnable, 1.0).await.unwrap();
        bus.emergency_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exception_code_surfaces() {
        let addr = spawn_responder(0, Some(0x02)).await;
        let bus = ModbusFieldBus::new(bus_config(addr));

        match bus.read_telemetry().await {
            Err(FieldBusError::ExceptionCode(0x02)) => {}
            other => panic!("expected exception code, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_category() {
        // Nothing listens on this port.
        let config = FieldBusConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..FieldBusConfig::default()
        };
        let bus = ModbusFieldBus::new(config);
        match bus.read_telemetry().await {
            Err(FieldBusError::Refused(_)) | Err(FieldBusError::Timeout(_)) => {}
            other => panic!("expected refused/timeout, got {other:?}"),
        }
    }
}
