use crate::consumer::BatchSettings;
use crate::orchestrator::StartupSettings;
use crate::sink::{RetryPolicy, SinkConfig};
use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub kafka_bootstrap: String,
    pub topic: String,
    pub consumer_group: String,
    pub offset_reset: OffsetReset,
    pub sink: SinkConfig,
    pub batch: BatchSettings,
    pub startup: StartupSettings,
    pub health_addr: SocketAddr,
    pub log_level: String,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        let kafka_bootstrap = env::var("KAFKA_BOOTSTRAP").unwrap_or_else(|_| "localhost:9092".to_string());
        let topic = env::var("GOVERNANCE_TOPIC").unwrap_or_else(|_| "governance.events".to_string());
        let consumer_group = env::var("CONSUMER_GROUP").unwrap_or_else(|_| "governance-ingest".to_string());
        let offset_reset = env::var("AUTO_OFFSET_RESET")
            .ok()
            .map(|value| parse_offset_reset(&value))
            .transpose()
            .context("Failed to parse AUTO_OFFSET_RESET")?
            .unwrap_or(OffsetReset::Earliest);

        let sink = SinkConfig {
            url: env::var("CLICKHOUSE_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string())
                .trim_end_matches('/')
                .to_string(),
            database: env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "governance".to_string()),
            table: env::var("CLICKHOUSE_TABLE").unwrap_or_else(|_| "events".to_string()),
            user: env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string()),
            password: env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            ping_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy {
                max_attempts: u64_from_env("SINK_MAX_RETRIES").unwrap_or(3).clamp(1, 10) as u32,
                base_delay: Duration::from_millis(u64_from_env("SINK_RETRY_BASE_MS").unwrap_or(2_000)),
            },
        };

        let batch = BatchSettings {
            max_size: u64_from_env("BATCH_SIZE").unwrap_or(1_000).max(1) as usize,
            max_age: Duration::from_millis(u64_from_env("BATCH_TIMEOUT_MS").unwrap_or(5_000).max(100)),
            poll_timeout: Duration::from_millis(u64_from_env("POLL_TIMEOUT_MS").unwrap_or(1_000).max(10)),
            max_flush_attempts: u64_from_env("FLUSH_MAX_ATTEMPTS").unwrap_or(1).max(1) as u32,
            progress_interval: Duration::from_secs(u64_from_env("PROGRESS_INTERVAL_SECONDS").unwrap_or(10).max(1)),
        };

        let startup = StartupSettings {
            max_attempts: u64_from_env("STARTUP_MAX_ATTEMPTS").unwrap_or(30).max(1) as u32,
            retry_interval: Duration::from_millis(u64_from_env("STARTUP_RETRY_INTERVAL_MS").unwrap_or(2_000)),
        };

        let host = env::var("HEALTH_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let ip: IpAddr = host.parse().with_context(|| format!("Invalid HEALTH_HOST '{host}'"))?;
        let port: u16 = env::var("HEALTH_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8090);

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            kafka_bootstrap,
            topic,
            consumer_group,
            offset_reset,
            sink,
            batch,
            startup,
            health_addr: SocketAddr::from((ip, port)),
            log_level,
        })
    }
}

fn u64_from_env(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u64>().ok())
}

fn parse_offset_reset(value: &str) -> Result<OffsetReset> {
    match value.trim().to_ascii_lowercase().as_str() {
        "earliest" | "smallest" => Ok(OffsetReset::Earliest),
        "latest" | "largest" => Ok(OffsetReset::Latest),
        other => Err(anyhow!("Unsupported offset reset policy '{other}'. Use earliest or latest.")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_reset_accepts_kafka_aliases() {
        assert_eq!(parse_offset_reset("Earliest").unwrap(), OffsetReset::Earliest);
        assert_eq!(parse_offset_reset("largest").unwrap(), OffsetReset::Latest);
        assert!(parse_offset_reset("beginning").is_err());
    }

    #[test]
    fn from_env_clamps_batch_bounds() {
        std::env::set_var("BATCH_SIZE", "0");
        std::env::set_var("BATCH_TIMEOUT_MS", "5");
        std::env::set_var("SINK_MAX_RETRIES", "not-a-number");
        let cfg = BridgeConfig::from_env().expect("config");
        assert_eq!(cfg.batch.max_size, 1);
        assert_eq!(cfg.batch.max_age, Duration::from_millis(100));
        assert_eq!(cfg.sink.retry.max_attempts, 3);
        assert_eq!(cfg.sink.retry.base_delay, Duration::from_secs(2));
        std::env::remove_var("BATCH_SIZE");
        std::env::remove_var("BATCH_TIMEOUT_MS");
        std::env::remove_var("SINK_MAX_RETRIES");
    }
}
