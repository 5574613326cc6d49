use crate::error::TtlError;
use std::sync::Arc;

/// Runtime configuration for a rowttl instance.
#[derive(Debug, Clone)]
pub struct TtlConfig {
    pub reaper_enabled: bool,
    pub reaper_interval_ms: u64,
    pub reaper_batch_size: usize,
    pub reaper_max_rows_per_cycle: usize,
    /// Consecutive cycles a row may be deferred before it is reported as stuck.
    pub stuck_row_report_after_sweeps: u32,
    /// Upper bound on the gap between logical expiry and physical removal.
    /// The reaper interval must not exceed it.
    pub max_reap_lag_ms: u64,
    pub lock_wait_timeout_ms: u64,
    pub max_clock_skew_ms: u64,
    pub durable_binlog: bool,
    pub manifest_hmac_key: Option<Arc<Vec<u8>>>,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            reaper_enabled: true,
            reaper_interval_ms: 1_000,
            reaper_batch_size: 256,
            reaper_max_rows_per_cycle: 64 * 1024,
            stuck_row_report_after_sweeps: 5,
            max_reap_lag_ms: 5_000,
            lock_wait_timeout_ms: 50_000,
            max_clock_skew_ms: 1_000,
            durable_binlog: true,
            manifest_hmac_key: None,
        }
    }
}

impl TtlConfig {
    pub fn production(hmac_key: [u8; 32]) -> Self {
        Self {
            manifest_hmac_key: Some(Arc::new(hmac_key.to_vec())),
            durable_binlog: true,
            ..Self::default()
        }
    }

    /// Short lock waits and no on-disk binlog. Used by tests and tooling.
    pub fn development() -> Self {
        Self {
            lock_wait_timeout_ms: 2_000,
            durable_binlog: false,
            manifest_hmac_key: None,
            ..Self::default()
        }
    }

    pub fn hmac_key(&self) -> Option<&[u8]> {
        self.manifest_hmac_key.as_ref().map(|k| k.as_slice())
    }

    pub fn with_hmac_key(mut self, key: Vec<u8>) -> Self {
        self.manifest_hmac_key = Some(Arc::new(key));
        self
    }

    pub fn lock_wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

pub(crate) fn validate_config(config: &TtlConfig) -> Result<(), TtlError> {
    if config.reaper_interval_ms == 0 {
        return Err(TtlError::InvalidConfig {
            message: "reaper_interval_ms must be > 0".into(),
        });
    }
    if config.reaper_batch_size == 0 || config.reaper_max_rows_per_cycle == 0 {
        return Err(TtlError::InvalidConfig {
            message: "reaper_batch_size and reaper_max_rows_per_cycle must be > 0".into(),
        });
    }
    if config.reaper_batch_size > config.reaper_max_rows_per_cycle {
        return Err(TtlError::InvalidConfig {
            message: "reaper_batch_size must be <= reaper_max_rows_per_cycle".into(),
        });
    }
    if config.reaper_interval_ms > config.max_reap_lag_ms {
        return Err(TtlError::InvalidConfig {
            message: format!(
                "reaper_interval_ms ({}) must be <= max_reap_lag_ms ({})",
                config.reaper_interval_ms, config.max_reap_lag_ms
            ),
        });
    }
    if config.stuck_row_report_after_sweeps == 0 {
        return Err(TtlError::InvalidConfig {
            message: "stuck_row_report_after_sweeps must be > 0".into(),
        });
    }
    if config.lock_wait_timeout_ms == 0 {
        return Err(TtlError::InvalidConfig {
            message: "lock_wait_timeout_ms must be > 0".into(),
        });
    }
    if let Some(key) = &config.manifest_hmac_key
        && key.is_empty()
    {
        return Err(TtlError::InvalidConfig {
            message: "manifest_hmac_key must not be empty".into(),
        });
    }
    Ok(())
}
