//! ClickHouse client for the analytics store: liveness probe, bulk insert with retry, and
//! diagnostic queries over the HTTP interface.

use async_trait::async_trait;
use common_events::EventEnvelope;
use reqwest::Client;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("clickhouse returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Bulk-insert target for decoded governance events.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn ping(&self) -> bool;

    /// Returns the number of rows durably written: `rows.len()` on success, 0 on failure.
    async fn insert_batch(&self, rows: &[EventEnvelope]) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Sleep after the given failed attempt (1-based): base, 2*base, 4*base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` is reached, sleeping with
/// exponential backoff between attempts.
pub async fn retry_with_backoff<T, E, Op, Fut, Sleep, SleepFut>(
    policy: RetryPolicy,
    mut op: Op,
    mut sleep: Sleep,
) -> Result<T, E>
where
    E: Display,
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Sleep: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                error!(attempt, max_attempts, error = %err, "giving up after final attempt");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %err, "attempt failed; backing off");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub url: String,
    pub database: String,
    pub table: String,
    pub user: String,
    pub password: String,
    pub ping_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl SinkConfig {
    pub fn qualified_table(&self) -> String { format!("{}.{}", self.database, self.table) }
}

#[derive(Clone)]
pub struct ClickHouseSink {
    client: Client,
    config: SinkConfig,
}

impl ClickHouseSink {
    pub fn new(config: SinkConfig) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &SinkConfig { &self.config }

    /// Diagnostic query; returns the raw response text.
    pub async fn query(&self, sql: &str) -> Result<String, SinkError> {
        let response = self
            .authorized(self.client.post(format!("{}/", self.config.url)))
            .query(&[("database", self.config.database.as_str())])
            .body(sql.to_string())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SinkError::Status { status: status.as_u16(), body });
        }
        Ok(body)
    }

    pub async fn count_rows(&self) -> Result<u64, SinkError> {
        let text = self.query(&format!("SELECT count() FROM {}", self.config.qualified_table())).await?;
        text.trim()
            .parse::<u64>()
            .map_err(|_| SinkError::Unexpected(format!("count() returned '{}'", text.trim())))
    }

    async fn post_rows(&self, body: String) -> Result<(), SinkError> {
        let insert = format!("INSERT INTO {} FORMAT JSONEachRow", self.config.qualified_table());
        let response = self
            .authorized(self.client.post(format!("{}/", self.config.url)))
            .query(&[("query", insert.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status { status: status.as_u16(), body: body.trim().to_string() });
        }
        Ok(())
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("X-ClickHouse-User", &self.config.user);
        if self.config.password.is_empty() {
            request
        } else {
            request.header("X-ClickHouse-Key", &self.config.password)
        }
    }
}

/// One JSON object per line, columns in envelope order.
pub fn to_ndjson(rows: &[EventEnvelope]) -> Result<String, serde_json::Error> {
    let mut out = String::with_capacity(rows.len() * 512);
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    Ok(out)
}

#[async_trait]
impl AnalyticsSink for ClickHouseSink {
    async fn ping(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/ping", self.config.url))
            .timeout(self.config.ping_timeout)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = response.status().as_u16(), "clickhouse ping returned failure status");
                false
            }
            Err(err) => {
                warn!(error = %err, "clickhouse ping failed");
                false
            }
        }
    }

    async fn insert_batch(&self, rows: &[EventEnvelope]) -> usize {
        if rows.is_empty() {
            return 0;
        }
        let body = match to_ndjson(rows) {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, rows = rows.len(), "failed to serialize batch");
                return 0;
            }
        };
        let this = self;
        let outcome = retry_with_backoff(
            self.config.retry,
            move |attempt| {
                debug!(attempt, rows = rows.len(), "inserting batch");
                this.post_rows(body.clone())
            },
            tokio::time::sleep,
        )
        .await;
        match outcome {
            Ok(()) => {
                info!(rows = rows.len(), table = %self.config.qualified_table(), "batch inserted");
                rows.len()
            }
            Err(err) => {
                error!(error = %err, rows = rows.len(), "batch insert failed after retries");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy { max_attempts: 3, base_delay: Duration::from_secs(2) };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn m_failures_then_success_takes_m_plus_one_attempts() {
        let policy = RetryPolicy { max_attempts: 5, base_delay: Duration::from_millis(10) };
        let failures = 3;
        let calls = AtomicU32::new(0);
        let sleeps = Mutex::new(Vec::new());
        let result = retry_with_backoff(
            policy,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { if attempt <= failures { Err("boom") } else { Ok(attempt) } }
            },
            |delay| {
                sleeps.lock().unwrap().push(delay);
                std::future::ready(())
            },
        )
        .await;
        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
        assert_eq!(
            *sleeps.lock().unwrap(),
            vec![Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(40)]
        );
    }

    #[tokio::test]
    async fn retries_bounded_by_ceiling() {
        let policy = RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1) };
        let calls = AtomicU32::new(0);
        let sleeps = Mutex::new(Vec::new());
        let result: Result<(), &str> = retry_with_backoff(
            policy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            },
            |delay| {
                sleeps.lock().unwrap().push(delay);
                std::future::ready(())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeps.lock().unwrap().len(), 2);
    }

    #[test]
    fn ndjson_has_one_line_per_row() {
        let row = common_events::decode(br#"{"event_id":"e1","event_type":"INJECT_SUCCESS","event_category":"access","metadata":{"a":1}}"#).unwrap();
        let body = to_ndjson(&[row.clone(), row]).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["metadata"], r#"{"a":1}"#);
        assert_eq!(parsed["org_id"], "");
    }
}
