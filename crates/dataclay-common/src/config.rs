//! Configuration types for dataClay-rs
//!
//! Plain serde structs with defaults matching the reference deployment.
//! Binaries load them from a file plus environment overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Backend process configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Human-readable backend name
    pub name: String,
    /// Directory for serialized object snapshots
    pub storage_path: PathBuf,
    /// Fraction of system memory above which eviction starts
    pub memory_high_fraction: f64,
    /// Fraction of system memory below which eviction stops
    pub memory_low_fraction: f64,
    /// Interval between background memory checks
    #[serde(with = "duration_secs")]
    pub memory_check_interval: Duration,
    /// Time to wait for an object lock when unloading (0 = non-blocking)
    #[serde(with = "duration_secs")]
    pub unload_timeout: Duration,
    /// Maximum time flush_all waits for an in-flight memory check
    #[serde(with = "duration_secs")]
    pub max_wait_for_memory_check: Duration,
    /// Default expiry horizon for sessions without explicit control
    #[serde(with = "duration_secs")]
    pub session_expiration: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "dataclay-backend".to_string(),
            storage_path: PathBuf::from("/data/storage"),
            memory_high_fraction: 0.75,
            memory_low_fraction: 0.50,
            memory_check_interval: Duration::from_secs(10),
            unload_timeout: Duration::from_secs(5),
            max_wait_for_memory_check: Duration::from_secs(60),
            session_expiration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Metadata service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Path of the kv database file (None = in-memory store)
    pub kv_path: Option<PathBuf>,
    /// Maximum time to wait for the kv store at startup
    #[serde(with = "duration_secs")]
    pub ready_timeout: Duration,
    /// Pause between readiness probes
    #[serde(with = "duration_secs")]
    pub ready_pause: Duration,
    /// Lifetime granted to newly created sessions
    #[serde(with = "duration_secs")]
    pub session_ttl: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            kv_path: None,
            ready_timeout: Duration::from_secs(30),
            ready_pause: Duration::from_millis(500),
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Client runtime configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Interval between backend pool refreshes
    #[serde(with = "duration_secs")]
    pub backend_refresh_interval: Duration,
    /// Timeout for a backend readiness probe
    #[serde(with = "duration_secs")]
    pub ready_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_refresh_interval: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(5),
        }
    }
}

/// Serialize durations as (fractional) seconds so config files stay readable.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_defaults() {
        let cfg = BackendConfig::default();
        assert!(cfg.memory_low_fraction < cfg.memory_high_fraction);
        assert_eq!(cfg.memory_check_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let cfg = BackendConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BackendConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.unload_timeout, cfg.unload_timeout);
        assert_eq!(back.storage_path, cfg.storage_path);
    }
}
