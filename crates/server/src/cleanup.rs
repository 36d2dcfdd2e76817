//! Daily purge of soft-deleted sessions past the retention window.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::{CleanupConfig, ConfigError},
    session::SessionService,
};

pub struct CleanupScheduler {
    service: Arc<SessionService>,
    retention: Duration,
    run_at: NaiveTime,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl CleanupScheduler {
    pub fn new(service: Arc<SessionService>, config: &CleanupConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            service,
            retention: config.retention()?,
            run_at: config.run_at_time()?,
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// One retention pass.
    pub async fn run_once(&self) -> Result<u64> {
        let deleted = self.service.run_cleanup(self.retention).await?;
        info!(
            deleted,
            retention_days = self.retention.num_days(),
            "session cleanup finished"
        );
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.add_auth_events("cleanup_deleted", deleted);
        }
        Ok(deleted)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(run_at = %self.run_at, "session cleanup scheduled daily (UTC)");
        let run_at = self.run_at;
        tokio::spawn(self.run(shutdown, move || delay_until_next_run(Utc::now(), run_at)))
    }

    async fn run<F>(self, shutdown: CancellationToken, mut next_delay: F)
    where
        F: FnMut() -> std::time::Duration + Send + 'static,
    {
        loop {
            let delay = next_delay();
            debug!(delay_secs = delay.as_secs(), "waiting for next session cleanup");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("session cleanup scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // Failures are retried at the next scheduled run.
            if let Err(err) = self.run_once().await {
                error!(?err, "session cleanup failed");
            }
        }
    }
}

/// Time from `now` until the next occurrence of `run_at`, strictly in the future.
pub fn delay_until_next_run(now: DateTime<Utc>, run_at: NaiveTime) -> std::time::Duration {
    let mut next = now.date_naive().and_time(run_at).and_utc();
    if next <= now {
        next += Duration::days(1);
    }
    (next - now).to_std().unwrap_or_default()
}
