//! Configuration types and defaults

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use trackwarp_core::{TrackWarpError, TrackWarpResult};
use trackwarp_media::LatencyPolicy;

/// Shortest allowed teardown grace period
pub const MIN_TEARDOWN_GRACE_MS: u64 = 100;
/// Longest allowed teardown grace period
pub const MAX_TEARDOWN_GRACE_MS: u64 = 500;

/// Where each track's worker runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// One OS thread with its own single-threaded runtime per track
    #[default]
    DedicatedThread,
    /// A task on the caller's runtime
    SharedRuntime,
}

/// Global trackwarp configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Enable debug logging
    pub debug_logging: bool,
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Frames buffered between pipeline hops
    pub channel_capacity: usize,
    /// How long an ending worker may take before it is terminated
    pub teardown_grace_ms: u64,
    /// Frame index after which the worker confirms setup
    pub setup_ack_frame: u64,
    /// How long to wait for a worker to answer setup
    pub setup_timeout_ms: u64,
    /// Execution context for workers
    pub context_mode: ContextMode,
    /// Which media kinds get injected latency
    pub latency: LatencyPolicy,
    /// Seed for stage randomness; entropy when unset
    pub rng_seed: Option<u64>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            debug_logging: false,
            log_filter: "info".to_string(),
            channel_capacity: 8,
            teardown_grace_ms: 250,
            setup_ack_frame: 2,
            setup_timeout_ms: 5_000,
            context_mode: ContextMode::DedicatedThread,
            latency: LatencyPolicy::default(),
            rng_seed: None,
        }
    }
}

impl GlobalConfig {
    /// Parse and validate JSON text
    pub fn from_json_str(text: &str) -> TrackWarpResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> TrackWarpResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> TrackWarpResult<()> {
        if !(MIN_TEARDOWN_GRACE_MS..=MAX_TEARDOWN_GRACE_MS).contains(&self.teardown_grace_ms) {
            return Err(invalid(format!(
                "teardown_grace_ms {} outside {}..={}",
                self.teardown_grace_ms, MIN_TEARDOWN_GRACE_MS, MAX_TEARDOWN_GRACE_MS
            )));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity must be positive".to_string()));
        }
        if self.setup_ack_frame == 0 {
            return Err(invalid("setup_ack_frame must be at least 1".to_string()));
        }
        if self.setup_timeout_ms == 0 {
            return Err(invalid("setup_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Grace period as a duration
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// Setup timeout as a duration
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    /// Filter directive after applying `debug_logging`
    pub fn effective_log_filter(&self) -> &str {
        if self.debug_logging {
            "debug"
        } else {
            &self.log_filter
        }
    }
}

fn invalid(reason: String) -> TrackWarpError {
    TrackWarpError::InvalidConfiguration { reason }
}
