use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

/// Default byte budget for the snapshot cache.
const DEFAULT_SNAPSHOT_CACHE_MAX_BYTES: u64 = 32 << 20;

const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for [`crate::proxy::CachingProxy`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Byte budget for the snapshot cache. Eviction approximates LFU.
    pub snapshot_cache_max_bytes: u64,

    /// Maintain a live in-memory replica fed by the store's schema-change
    /// stream. When disabled, every read goes through the snapshot cache.
    pub watch_enabled: bool,

    /// Drop replica entries older than this wall-clock age. `None` disables
    /// trimming; the replica then grows with revision history.
    pub retention_horizon: Option<Duration>,

    /// Backoff applied between attempts to re-establish a failed watch
    /// stream.
    pub backoff: BackoffConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            snapshot_cache_max_bytes: DEFAULT_SNAPSHOT_CACHE_MAX_BYTES,
            watch_enabled: false,
            retention_horizon: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}
