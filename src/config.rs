//! Immutable server configuration, read once at startup (design notes §9).
//!
//! Replaces the source's filesystem-manager singleton and flag registry: a `Config`
//! is parsed once (by the binary, from TOML — see [`Config::from_toml`]) and then
//! passed by reference through the rest of the crate.

use serde::Deserialize;

/// Server-wide tunables. Defaults match spec.md's stated defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Heartbeat interval in seconds (`H` in spec.md §3).
    pub heartbeat_s: u64,
    /// NFSv4.1 lease time in seconds.
    pub lease_s: u64,
    /// Grace period duration in seconds, counted from server start.
    pub grace_s: u64,
    /// Target replica count `R` for newly placed pieces.
    pub replicas: usize,
    /// Chunk size used when copying piece data during resilver, in bytes.
    pub resilver_chunk_bytes: usize,
    /// Default piece (block) size for newly created regular files. Must be 0 or a
    /// power of two.
    pub piece_size: u64,
    /// Open `DataFile` handle LRU cost limit on a data server (§4.A).
    pub piece_store_cache_limit: u64,
    /// Rate limit, in repair tasks enqueued per second, during mass resilver.
    pub resilver_rate_per_sec: u32,
    /// Override for the filesystem id; `None` generates one at first startup.
    pub fsid_override: Option<u128>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_s: 5,
            lease_s: 120,
            grace_s: 120,
            replicas: 3,
            resilver_chunk_bytes: 32 * 1024,
            piece_size: 0,
            piece_store_cache_limit: 512,
            resilver_rate_per_sec: 100,
            fsid_override: None,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// MISSING timer duration, `2*H` (spec.md §3).
    pub fn missing_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_s * 2)
    }

    /// DEAD timer duration, `8*H` (spec.md §3).
    pub fn dead_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_s * 8)
    }
}
