//! Cache Manager
//!
//! In-memory snapshot of cloud-supplied inputs with freshness stamps. Every
//! entry has a compiled-in default, so the decision engine is never blocked
//! on a cold cache. The subscription dispatcher is the only writer; the
//! control loop takes one immutable snapshot at the top of each cycle, so a
//! cloud update is visible on the next cycle, never the current one.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::OptimizationConfig;
use crate::engine::DecisionAction;

/// One cached value with its freshness stamp. `ttl = None` is sticky.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub updated_at: Instant,
    pub ttl: Option<Duration>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            updated_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_fresh(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.updated_at.elapsed() < ttl,
            None => true,
        }
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        self.updated_at = Instant::now();
    }
}

/// A setpoint pushed by the cloud coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSetpoint {
    pub action: DecisionAction,
    pub power_kw: f64,
    #[serde(default)]
    pub reason: String,
}

const SETPOINT_TTL: Duration = Duration::from_secs(15 * 60);
const FORECAST_TTL: Duration = Duration::from_secs(6 * 3600);

/// Default per-hour tariff used until the cloud supplies one: cheap
/// overnight, morning ramp, evening peak.
pub const DEFAULT_PRICES: [f64; 24] = [
    0.30, 0.28, 0.27, 0.26, 0.26, 0.28, 0.35, 0.45, 0.55, 0.60, 0.62, 0.65, 0.60, 0.58, 0.55,
    0.58, 0.65, 0.80, 0.95, 0.90, 0.75, 0.55, 0.42, 0.35,
];

struct CacheState {
    prices: CacheEntry<[f64; 24]>,
    load_forecast: CacheEntry<Vec<f64>>,
    solar_forecast: CacheEntry<Vec<f64>>,
    cloud_setpoint: CacheEntry<Option<CloudSetpoint>>,
    optimization_config: CacheEntry<OptimizationConfig>,
}

/// Point-in-time view handed to the decision engine.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub prices: [f64; 24],
    pub load_forecast: Vec<f64>,
    pub solar_forecast: Vec<f64>,
    /// Present only while the underlying entry is fresh
    pub cloud_setpoint: Option<CloudSetpoint>,
    pub optimization_config: OptimizationConfig,
}

impl CacheSnapshot {
    /// Solar forecast for a given hour, 0.0 beyond the series.
    pub fn solar_kw_at_hour(&self, hour: usize) -> f64 {
        self.solar_forecast.get(hour).copied().unwrap_or(0.0)
    }
}

/// Cache manager: many readers, one writer (the subscription dispatcher).
pub struct CacheManager {
    inner: RwLock<CacheState>,
}

impl CacheManager {
    pub fn new(optimization_config: OptimizationConfig) -> Self {
        Self {
            inner: RwLock::new(CacheState {
                prices: CacheEntry::new(DEFAULT_PRICES, Some(FORECAST_TTL)),
                load_forecast: CacheEntry::new(vec![0.0; 24], Some(FORECAST_TTL)),
                solar_forecast: CacheEntry::new(vec![0.0; 24], Some(FORECAST_TTL)),
                cloud_setpoint: CacheEntry::new(None, Some(SETPOINT_TTL)),
                optimization_config: CacheEntry::new(optimization_config, None),
            }),
        }
    }

    /// Take the per-cycle snapshot. Stale entries decay to their defaults
    /// right here, so readers never see expired data.
    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.inner.read();
        CacheSnapshot {
            prices: if state.prices.is_fresh() {
                state.prices.value
            } else {
                DEFAULT_PRICES
            },
            load_forecast: if state.load_forecast.is_fresh() {
                state.load_forecast.value.clone()
            } else {
                vec![0.0; 24]
            },
            solar_forecast: if state.solar_forecast.is_fresh() {
                state.solar_forecast.value.clone()
            } else {
                vec![0.0; 24]
            },
            cloud_setpoint: if state.cloud_setpoint.is_fresh() {
                state.cloud_setpoint.value.clone()
            } else {
                None
            },
            optimization_config: state.optimization_config.value.clone(),
        }
    }

    /// Update the price table. Tables that are not exactly 24 hours are
    /// ignored rather than poisoning the cache.
    pub fn update_prices(&self, prices: &[f64]) {
        if prices.len() != 24 || prices.iter().any(|p| !p.is_finite()) {
            tracing::warn!("ignoring invalid price table ({} entries)", prices.len());
            return;
        }
        let mut table = [0.0; 24];
        table.copy_from_slice(prices);
        self.inner.write().prices.set(table);
    }

    pub fn update_load_forecast(&self, forecast: Vec<f64>) {
        if forecast.iter().any(|v| !v.is_finite()) {
            tracing::warn!("ignoring load forecast with non-finite entries");
            return;
        }
        self.inner.write().load_forecast.set(forecast);
    }

    pub fn update_solar_forecast(&self, forecast: Vec<f64>) {
        if forecast.iter().any(|v| !v.is_finite()) {
            tracing::warn!("ignoring solar forecast with non-finite entries");
            return;
        }
        self.inner.write().solar_forecast.set(forecast);
    }

    pub fn set_cloud_setpoint(&self, setpoint: CloudSetpoint) {
        self.inner.write().cloud_setpoint.set(Some(setpoint));
    }

    pub fn is_cloud_setpoint_fresh(&self) -> bool {
        let state = self.inner.read();
        state.cloud_setpoint.is_fresh() && state.cloud_setpoint.value.is_some()
    }

    /// Config is sticky: it stays until replaced.
    pub fn update_optimization_config(&self, config: OptimizationConfig) {
        self.inner.write().optimization_config.set(config);
    }

    pub fn optimization_config(&self) -> OptimizationConfig {
        self.inner.read().optimization_config.value.clone()
    }

    /// Drop forecast/price entries back to defaults (memory remediation).
    pub fn drop_volatile(&self) {
        let mut state = self.inner.write();
        state.prices = CacheEntry::new(DEFAULT_PRICES, Some(FORECAST_TTL));
        state.load_forecast = CacheEntry::new(vec![0.0; 24], Some(FORECAST_TTL));
        state.solar_forecast = CacheEntry::new(vec![0.0; 24], Some(FORECAST_TTL));
    }

    /// Force the setpoint entry stale (test hook: avoids waiting out the TTL).
    #[cfg(test)]
    pub fn expire_cloud_setpoint(&self) {
        self.inner.write().cloud_setpoint.ttl = Some(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> CacheManager {
        CacheManager::new(OptimizationConfig::default())
    }

    #[test]
    fn test_defaults_available_immediately() {
        let snapshot = cache().snapshot();
        assert_eq!(snapshot.prices.len(), 24);
        assert!(snapshot.cloud_setpoint.is_none());
        assert_eq!(snapshot.solar_kw_at_hour(12), 0.0);
    }

    #[test]
    fn test_update_prices() {
        let cache = cache();
        cache.update_prices(&[0.99; 24]);
        assert_eq!(cache.snapshot().prices[0], 0.99);
    }

    #[test]
    fn test_invalid_price_table_ignored() {
        let cache = cache();
        cache.update_prices(&[0.3]); // too few hours
        assert_eq!(cache.snapshot().prices, DEFAULT_PRICES);
    }

    #[test]
    fn test_setpoint_expires() {
        let cache = cache();
        cache.set_cloud_setpoint(CloudSetpoint {
            action: DecisionAction::Charge,
            power_kw: 30.0,
            reason: "cheap overnight rate".into(),
        });
        assert!(cache.is_cloud_setpoint_fresh());
        assert!(cache.snapshot().cloud_setpoint.is_some());

        cache.expire_cloud_setpoint();
        assert!(!cache.is_cloud_setpoint_fresh());
        assert!(cache.snapshot().cloud_setpoint.is_none());
    }

    #[test]
    fn test_config_is_sticky() {
        let cache = cache();
        let mut config = OptimizationConfig::default();
        config.arbitrage.buy_threshold_price = 0.10;
        cache.update_optimization_config(config);
        assert_eq!(cache.optimization_config().arbitrage.buy_threshold_price, 0.10);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let cache = cache();
        let snapshot = cache.snapshot();
        cache.update_prices(&[0.11; 24]);
        // The already-taken snapshot still sees the old table
        assert_eq!(snapshot.prices, DEFAULT_PRICES);
    }
}
