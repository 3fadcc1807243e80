use crate::bus::{BusError, KafkaSource};
use crate::config::BridgeConfig;
use crate::consumer::{BatchConsumer, ConsumerState};
use crate::health::HealthServer;
use crate::metrics::Metrics;
use crate::sink::{AnalyticsSink, ClickHouseSink};
use anyhow::{bail, Context, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct StartupSettings {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

/// Retries until both the bus subscription and a live sink exist. Whichever side connects
/// first is kept while the other is retried. Exhausting the attempts is fatal.
pub async fn establish<B, S, C, Fut>(
    settings: StartupSettings,
    metrics: &Metrics,
    mut connect_bus: C,
    sink: &S,
) -> Result<B>
where
    C: FnMut() -> Fut,
    Fut: Future<Output = Result<B, BusError>>,
    S: AnalyticsSink + ?Sized,
{
    info!(from = ?ConsumerState::Disconnected, to = ?ConsumerState::Connecting, "consumer state change");
    let max_attempts = settings.max_attempts.max(1);
    let mut source = None;
    let mut sink_ok = false;
    for attempt in 1..=max_attempts {
        if source.is_none() {
            match connect_bus().await {
                Ok(connected) => {
                    metrics.set_bus_connected(true);
                    source = Some(connected);
                }
                Err(err) => warn!(attempt, max_attempts, error = %err, "bus not ready"),
            }
        }
        if !sink_ok {
            sink_ok = sink.ping().await;
            metrics.set_sink_connected(sink_ok);
            if !sink_ok {
                warn!(attempt, max_attempts, "analytics store not ready");
            }
        }
        if sink_ok {
            if let Some(source) = source.take() {
                info!(attempt, "bus and analytics store connected");
                return Ok(source);
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(settings.retry_interval).await;
        }
    }
    bail!(
        "startup failed after {max_attempts} attempts (bus_connected={}, sink_connected={sink_ok})",
        source.is_some()
    )
}

/// Sets `flag` on SIGINT or SIGTERM. The consumer loop checks it between polls.
pub fn install_signal_handlers(flag: Arc<AtomicBool>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        tokio::spawn(async move {
            let name = tokio::select! {
                _ = terminate.recv() => "SIGTERM",
                _ = interrupt.recv() => "SIGINT",
            };
            info!(signal = name, "shutdown requested");
            flag.store(true, Ordering::SeqCst);
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(signal = "ctrl-c", "shutdown requested");
                flag.store(true, Ordering::SeqCst);
            }
        });
    }
    Ok(())
}

/// Runs the blocking rdkafka handshake off the async workers.
async fn connect_kafka(config: BridgeConfig) -> Result<KafkaSource, BusError> {
    tokio::task::spawn_blocking(move || KafkaSource::connect(&config))
        .await
        .unwrap_or_else(|err| Err(BusError::Create(format!("connect task failed: {err}"))))
}

/// Serves health, connects, consumes until signalled, then drains.
pub async fn run(config: BridgeConfig) -> Result<()> {
    let metrics = Arc::new(Metrics::new());
    let sink = Arc::new(ClickHouseSink::new(config.sink.clone()).context("failed to build clickhouse client")?);

    // Bound before connecting; reports unhealthy until both sides are up.
    let health = HealthServer::spawn(config.health_addr, metrics.clone()).await?;
    let source = match establish(config.startup, &metrics, || connect_kafka(config.clone()), sink.as_ref()).await {
        Ok(source) => source,
        Err(err) => {
            health.shutdown();
            return Err(err);
        }
    };
    match sink.count_rows().await {
        Ok(rows) => info!(rows, table = %sink.config().qualified_table(), "analytics table reachable"),
        Err(err) => warn!(error = %err, "could not read analytics row count"),
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(shutdown.clone())?;

    let mut consumer = BatchConsumer::new(source, sink, metrics.clone(), config.batch.clone());
    let worker = tokio::spawn(async move {
        consumer.run(&shutdown).await;
        consumer.state()
    });
    let final_state = worker.await.context("consumer task failed")?;

    health.shutdown();
    let snap = metrics.snapshot();
    info!(
        state = ?final_state,
        consumed = snap.events_consumed,
        inserted = snap.events_inserted,
        errors = snap.errors,
        "ingest bridge stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common_events::EventEnvelope;

    struct FlakySink {
        up_after: u32,
        pings: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl AnalyticsSink for FlakySink {
        async fn ping(&self) -> bool {
            self.pings.fetch_add(1, Ordering::SeqCst) + 1 >= self.up_after
        }
        async fn insert_batch(&self, rows: &[EventEnvelope]) -> usize { rows.len() }
    }

    fn settings(max_attempts: u32) -> StartupSettings {
        StartupSettings { max_attempts, retry_interval: Duration::from_millis(1) }
    }

    #[tokio::test]
    async fn connects_once_both_sides_are_up() {
        let metrics = Metrics::new();
        let sink = FlakySink { up_after: 2, pings: Default::default() };
        let mut bus_attempts = 0;
        let source = establish(
            settings(5),
            &metrics,
            || {
                bus_attempts += 1;
                std::future::ready(if bus_attempts < 3 { Err(BusError::Unreachable("no brokers".into())) } else { Ok(bus_attempts) })
            },
            &sink,
        )
        .await
        .expect("connected");
        assert_eq!(source, 3);
        assert_eq!(sink.pings.load(Ordering::SeqCst), 2, "sink re-pinged after it was already live");
        let snap = metrics.snapshot();
        assert!(snap.bus_connected && snap.sink_connected);
        assert_eq!(snap.status, "healthy");
    }

    #[tokio::test]
    async fn exhausting_attempts_is_fatal() {
        let metrics = Metrics::new();
        let sink = FlakySink { up_after: 1, pings: Default::default() };
        let mut bus_attempts = 0;
        let result: Result<()> = establish(
            settings(4),
            &metrics,
            || {
                bus_attempts += 1;
                std::future::ready(Err(BusError::Unreachable("no brokers".into())))
            },
            &sink,
        )
        .await;
        let err = result.expect_err("startup should fail");
        assert!(err.to_string().contains("after 4 attempts"), "{err}");
        assert_eq!(bus_attempts, 4);
        assert!(!metrics.snapshot().bus_connected);
    }

    #[tokio::test]
    async fn health_reports_unhealthy_while_startup_retries() {
        let metrics = Arc::new(Metrics::new());
        let health = HealthServer::spawn("127.0.0.1:0".parse().unwrap(), metrics.clone()).await.expect("bind");
        let url = format!("http://{}/health", health.local_addr());
        let sink = FlakySink { up_after: 1, pings: Default::default() };

        let connecting = establish(
            StartupSettings { max_attempts: 3, retry_interval: Duration::from_millis(200) },
            &metrics,
            || std::future::ready(Err::<(), _>(BusError::Unreachable("no brokers".into()))),
            &sink,
        );
        let fetch_health = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
            body
        };
        let (result, body) = tokio::join!(connecting, fetch_health);

        assert!(result.is_err());
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["bus_connected"], false);
        assert_eq!(body["sink_connected"], true);
        health.shutdown();
    }
}
