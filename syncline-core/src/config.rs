//! Tunables for the sync core.
//!
//! Every struct has a `Default` matching the documented defaults and deserializes
//! with per-field defaults, so a partial JSON document is a valid config.
//! [`SyncConfig::from_env`] overlays `SYNCLINE_*` environment variables on top.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry (milliseconds).
    pub base_delay_ms: u64,
    /// Upper bound on the un-jittered delay (milliseconds).
    pub max_delay_ms: u64,
    /// Consecutive automatic attempts before giving up.
    pub max_retries: u32,
    /// A connect attempt still pending after this long counts as failed (milliseconds).
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 5,
            connect_timeout_ms: 15_000,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatchUpConfig {
    pub page_size: usize,
    /// Hard ceiling on events requested in one catch-up pass.
    pub max_events: usize,
    /// Retries per page after the first attempt, transient failures only.
    pub page_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_events: 500,
            page_retries: 3,
            retry_delay_ms: 200,
        }
    }
}

impl CatchUpConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LookupConfig {
    pub capacity: usize,
    pub batch_window_ms: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            batch_window_ms: 100,
        }
    }
}

impl LookupConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    /// Processed identities remembered per channel.
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl_secs: 300,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub reconnect: ReconnectConfig,
    pub catch_up: CatchUpConfig,
    pub lookup: LookupConfig,
    pub dedup: DedupConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from defaults plus whatever `lookup` yields for the
    /// `SYNCLINE_*` variable names.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        override_from(&lookup, "SYNCLINE_MAX_RETRIES", &mut config.reconnect.max_retries);
        override_from(&lookup, "SYNCLINE_BACKOFF_BASE_MS", &mut config.reconnect.base_delay_ms);
        override_from(&lookup, "SYNCLINE_BACKOFF_CAP_MS", &mut config.reconnect.max_delay_ms);
        override_from(
            &lookup,
            "SYNCLINE_CONNECT_TIMEOUT_MS",
            &mut config.reconnect.connect_timeout_ms,
        );
        override_from(&lookup, "SYNCLINE_PAGE_SIZE", &mut config.catch_up.page_size);
        override_from(&lookup, "SYNCLINE_CATCH_UP_CAP", &mut config.catch_up.max_events);
        override_from(&lookup, "SYNCLINE_LOOKUP_CAPACITY", &mut config.lookup.capacity);
        override_from(&lookup, "SYNCLINE_LOOKUP_WINDOW_MS", &mut config.lookup.batch_window_ms);
        config
    }
}

fn override_from<F, T>(lookup: &F, name: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!("Ignoring unparsable {}={:?}", name, raw),
    }
}
