//! TOML-backed bus configuration.

use crate::scheduler::PersistedSchedulerConfig;
use crate::BusError;
use outbox::OutboxDispatcherConfig;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Top-level bus configuration, loadable from TOML.
///
/// The sections convert into the runtime configs they describe:
/// `&OutboxSection` into [`OutboxDispatcherConfig`], `&SchedulerSection` into
/// [`PersistedSchedulerConfig`], and [`BusConfig::request_timeout`] supplies
/// the timeout for [`crate::Bus::request_client`].
///
/// ```toml
/// bus_address = "loopback://localhost/bus"
/// request_timeout_ms = 5000
///
/// [outbox]
/// poll_interval_ms = 1000
/// retry_delay_ms = 1000
/// batch_size = 100
/// channel_capacity = 1024
/// max_concurrent_destinations = 16
///
/// [scheduler]
/// poll_interval_ms = 1000
/// batch_size = 100
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub bus_address: Url,
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub outbox: OutboxSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxSection {
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "defaults::max_concurrent_destinations")]
    pub max_concurrent_destinations: usize,
}

impl Default for OutboxSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::poll_interval_ms(),
            retry_delay_ms: defaults::retry_delay_ms(),
            batch_size: defaults::batch_size(),
            channel_capacity: defaults::channel_capacity(),
            max_concurrent_destinations: defaults::max_concurrent_destinations(),
        }
    }
}

impl From<&OutboxSection> for OutboxDispatcherConfig {
    fn from(section: &OutboxSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            retry_delay: Duration::from_millis(section.retry_delay_ms),
            batch_size: section.batch_size,
            channel_capacity: section.channel_capacity,
            max_concurrent_destinations: section.max_concurrent_destinations,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::poll_interval_ms(),
            batch_size: defaults::batch_size(),
        }
    }
}

impl From<&SchedulerSection> for PersistedSchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            batch_size: section.batch_size,
        }
    }
}

mod defaults {
    pub fn request_timeout_ms() -> u64 {
        5_000
    }
    pub fn poll_interval_ms() -> u64 {
        1_000
    }
    pub fn retry_delay_ms() -> u64 {
        1_000
    }
    pub fn batch_size() -> usize {
        100
    }
    pub fn channel_capacity() -> usize {
        1_024
    }
    pub fn max_concurrent_destinations() -> usize {
        16
    }
}

impl BusConfig {
    pub fn from_toml(raw: &str) -> Result<Self, BusError> {
        let config: BusConfig = toml::from_str(raw)
            .map_err(|e| BusError::configuration(format!("invalid bus config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.request_timeout_ms == 0 {
            return Err(BusError::configuration("request_timeout_ms must be > 0"));
        }
        for (name, value) in [
            ("outbox.batch_size", self.outbox.batch_size),
            ("outbox.channel_capacity", self.outbox.channel_capacity),
            (
                "outbox.max_concurrent_destinations",
                self.outbox.max_concurrent_destinations,
            ),
            ("scheduler.batch_size", self.scheduler.batch_size),
        ] {
            if value == 0 {
                return Err(BusError::configuration(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
