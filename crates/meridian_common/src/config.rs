use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum age of a read timestamp before reads fail with `OutOfRange`.
    /// Versions older than this horizon become eligible for garbage
    /// collection.
    #[serde(default = "default_version_gc_horizon_secs")]
    pub version_gc_horizon_secs: u64,

    /// How long a lock request may block before the transaction is aborted.
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub lock_wait_timeout_ms: u64,

    #[serde(default)]
    pub gc: GcSectionConfig,
}

/// Background GC sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcSectionConfig {
    /// Enable GC sweeps (default: true).
    pub enabled: bool,
    /// Interval between sweeps in milliseconds (default: 1000).
    pub interval_ms: u64,
    /// Max keys per sweep (0 = unlimited).
    pub batch_size: usize,
}

fn default_version_gc_horizon_secs() -> u64 {
    3600
}

fn default_lock_wait_timeout_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version_gc_horizon_secs: default_version_gc_horizon_secs(),
            lock_wait_timeout_ms: default_lock_wait_timeout_ms(),
            gc: GcSectionConfig::default(),
        }
    }
}

impl Default for GcSectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            batch_size: 0,
        }
    }
}

impl EngineConfig {
    pub fn version_gc_horizon(&self) -> Duration {
        Duration::from_secs(self.version_gc_horizon_secs)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}
