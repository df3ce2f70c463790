use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::backfill::BackfillDriver;
use crate::config::Settings;
use crate::http_client::{FetchClient, RetryPolicy};
use crate::normalize::{LedgerNormalizer, Normalizer};
use crate::tailer::LiveTailer;
use crate::tuner::{Tuner, TunerThresholds};
use crate::writer::{ChunkedWriter, ColumnStoreWriter, Writer, WriterPool};

/// Explicit top-level lifecycle value. Everything the backfill driver and
/// live tailer share is constructed once here and passed down, never
/// stashed in a global.
pub struct Engine {
    settings: Settings,
    client: Arc<FetchClient>,
    normalizer: Arc<dyn Normalizer>,
    pool: Arc<WriterPool>,
    tuner: Arc<Tuner>,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Self> {
        let retry = RetryPolicy::default();
        let client = Arc::new(FetchClient::new(settings.scan_url.clone(), settings.insecure_tls, retry)?);

        let writers: Vec<Arc<dyn Writer>> = vec![
            Arc::new(ColumnStoreWriter::new(100_000)),
            Arc::new(ChunkedWriter::new(3)),
        ];
        let pool = Arc::new(WriterPool::new(
            writers,
            PathBuf::from(&settings.data_dir),
            settings.rows_per_file,
            settings.writer_workers,
        ));

        let thresholds = TunerThresholds {
            min: settings.min_parallel_fetches as i64,
            max: settings.max_parallel_fetches as i64,
            base: settings.parallel_fetches as i64,
            latency_low_ms: settings.latency_low_ms as f64,
            latency_high_ms: settings.latency_high_ms as f64,
            latency_critical_ms: settings.latency_critical_ms as f64,
        };
        let tuner = Arc::new(Tuner::new(thresholds));

        Ok(Self {
            settings,
            client,
            normalizer: Arc::new(LedgerNormalizer),
            pool,
            tuner,
        })
    }

    /// Runs backfill to completion, then hands off to the live tailer.
    /// Returns only on fatal error or external cancellation (see
    /// `shutdown`, invoked by the caller's signal handling).
    pub async fn run(&self) -> Result<()> {
        let driver = BackfillDriver::new(
            self.client.clone(),
            self.normalizer.clone(),
            self.pool.clone(),
            self.tuner.clone(),
            &self.settings,
        );
        driver.run().await?;
        info!("backfill complete across all migrations, starting live tail");

        let tailer = LiveTailer::new(
            self.client.clone(),
            self.normalizer.clone(),
            self.pool.clone(),
            PathBuf::from(&self.settings.cursor_dir),
            PathBuf::from(&self.settings.data_dir),
            self.settings.batch_size,
            Duration::from_secs(self.settings.poll_interval_secs),
            Duration::from_millis(self.settings.stall_threshold_ms),
        );
        tailer.run().await
    }

    /// Graceful shutdown: stop accepting new work, flush every buffered
    /// batch, wait for writers to go idle, then shut the pool down.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down: flushing writer pool");
        self.pool.shutdown().await?;
        Ok(())
    }
}
