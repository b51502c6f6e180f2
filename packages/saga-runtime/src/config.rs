use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;

use crate::broker::{Acks, Compression, SendOptions};

/// How `Put` effects reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One plain send per action, recovering retriable failures.
    Direct,
    /// One broker transaction per action, no retry.
    Transactional,
    /// Queued and flushed in batches on a timer.
    #[default]
    Throttled,
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(DeliveryMode::Direct),
            "transactional" => Ok(DeliveryMode::Transactional),
            "throttled" => Ok(DeliveryMode::Throttled),
            other => Err(anyhow!("unknown delivery mode '{other}'")),
        }
    }
}

impl FromStr for Acks {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(Acks::None),
            "1" | "leader" => Ok(Acks::Leader),
            "-1" | "all" => Ok(Acks::All),
            other => Err(anyhow!("unknown acks level '{other}'")),
        }
    }
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(anyhow!("unknown compression codec '{other}'")),
        }
    }
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub client_id: String,
    pub consumer_group: String,
    pub delivery_mode: DeliveryMode,
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub retry_backoff_step: Duration,
    pub max_retry_backoff: Duration,
    pub max_send_retries: u32,
    pub topic_partitions: i32,
    pub acks: Acks,
    pub compression: Compression,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            client_id: "saga-runtime".to_string(),
            consumer_group: "saga-runtime".to_string(),
            delivery_mode: DeliveryMode::default(),
            flush_interval: Duration::from_millis(1000),
            max_batch_size: 100,
            retry_backoff_step: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(5000),
            max_send_retries: 3,
            topic_partitions: 1,
            acks: Acks::default(),
            compression: Compression::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            client_id: lookup("SAGA_CLIENT_ID").unwrap_or(defaults.client_id),
            consumer_group: lookup("SAGA_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            delivery_mode: parse_or(&lookup, "SAGA_DELIVERY_MODE", defaults.delivery_mode)?,
            flush_interval: nonzero_millis_or(
                &lookup,
                "SAGA_FLUSH_INTERVAL_MS",
                defaults.flush_interval,
            )?,
            max_batch_size: parse_or(&lookup, "SAGA_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            retry_backoff_step: millis_or(
                &lookup,
                "SAGA_RETRY_BACKOFF_STEP_MS",
                defaults.retry_backoff_step,
            )?,
            max_retry_backoff: millis_or(
                &lookup,
                "SAGA_MAX_RETRY_BACKOFF_MS",
                defaults.max_retry_backoff,
            )?,
            max_send_retries: parse_or(&lookup, "SAGA_MAX_SEND_RETRIES", defaults.max_send_retries)?,
            topic_partitions: parse_or(&lookup, "SAGA_TOPIC_PARTITIONS", defaults.topic_partitions)?,
            acks: parse_or(&lookup, "SAGA_ACKS", defaults.acks)?,
            compression: parse_or(&lookup, "SAGA_COMPRESSION", defaults.compression)?,
        })
    }

    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            acks: self.acks,
            compression: self.compression,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn nonzero_millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let duration = millis_or(lookup, key, default)?;
    if duration.is_zero() {
        return Err(anyhow!("must be at least 1ms"))
            .with_context(|| format!("{key} has an invalid value '0'"));
    }
    Ok(duration)
}
