use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::EngineError;
use crate::model::{MigrationId, RawTransactionEnvelope, SynchronizerRange};

const LATENCY_WINDOW: usize = 100;

/// Rolling request statistics feeding the auto-tuner.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub success_count: u64,
    pub retry503_count: u64,
    pub error_count: u64,
    latencies: VecDeque<Duration>,
}

impl FetchStats {
    fn record_latency(&mut self, d: Duration) {
        self.latencies.push_back(d);
        while self.latencies.len() > LATENCY_WINDOW {
            self.latencies.pop_front();
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let total: u128 = self.latencies.iter().map(|d| d.as_millis()).sum();
        total as f64 / self.latencies.len() as f64
    }

    pub fn p95_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<u128> = self.latencies.iter().map(|d| d.as_millis()).collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        let idx = idx.min(sorted.len()).saturating_sub(1);
        sorted[idx] as f64
    }

    pub fn reset_window(&mut self) {
        self.success_count = 0;
        self.retry503_count = 0;
        self.error_count = 0;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        429 | 500 | 502 | 503 | 504
    )
}

fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Serialize)]
struct MigrationInfoRequest {
    migration_id: MigrationId,
}

#[derive(Debug, Deserialize)]
pub struct MigrationInfoResponse {
    pub record_time_range: Vec<SynchronizerRange>,
}

#[derive(Debug, Serialize)]
struct UpdatesBeforeRequest {
    migration_id: MigrationId,
    synchronizer_id: String,
    before: DateTime<Utc>,
    at_or_after: DateTime<Utc>,
    count: usize,
}

#[derive(Debug, Serialize)]
struct UpdatesAfterCursor {
    after_migration_id: MigrationId,
    after_record_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct UpdatesForwardRequest {
    page_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<UpdatesAfterCursor>,
    daml_value_encoding: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<RawTransactionEnvelope>,
}

/// HTTP client for the remote scan API.
pub struct FetchClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    stats: Mutex<FetchStats>,
}

impl FetchClient {
    pub fn new(base_url: String, insecure_tls: bool, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url,
            retry,
            stats: Mutex::new(FetchStats::default()),
        })
    }

    pub fn stats_snapshot(&self) -> (u64, u64, u64, f64, f64) {
        let s = self.stats.lock().unwrap();
        (
            s.success_count,
            s.retry503_count,
            s.error_count,
            s.avg_latency_ms(),
            s.p95_latency_ms(),
        )
    }

    pub fn reset_stats_window(&self) {
        self.stats.lock().unwrap().reset_window();
    }

    #[cfg(test)]
    pub fn inject_stats_for_test(&self, success: u64, retry503: u64, errors: u64) {
        let mut s = self.stats.lock().unwrap();
        s.success_count = success;
        s.retry503_count = retry503;
        s.error_count = errors;
    }

    /// Posts with bounded retry. On exhaustion or a non-retryable outcome,
    /// returns an `EngineError` the caller can inspect via `is_retryable()`
    /// to distinguish transient from non-retryable transport failures.
    async fn post_with_retry<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Option<Resp>, EngineError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            let start = Instant::now();
            let result = tokio::time::timeout(
                self.retry.timeout,
                self.client.post(&url).json(body).send(),
            )
            .await;

            let outcome: std::result::Result<(), String> = match result {
                Err(_) => Err(format!("request to {path} timed out")),
                Ok(Ok(resp)) => {
                    let elapsed = start.elapsed();
                    self.stats.lock().unwrap().record_latency(elapsed);

                    if resp.status() == StatusCode::NOT_FOUND {
                        self.stats.lock().unwrap().success_count += 1;
                        return Ok(None);
                    }
                    if resp.status().is_success() {
                        match resp.json::<Resp>().await {
                            Ok(v) => {
                                self.stats.lock().unwrap().success_count += 1;
                                return Ok(Some(v));
                            }
                            Err(e) => Err(format!("decoding response from {path}: {e}")),
                        }
                    } else if is_retryable_status(resp.status()) {
                        if resp.status() == StatusCode::SERVICE_UNAVAILABLE {
                            self.stats.lock().unwrap().retry503_count += 1;
                        }
                        Err(format!("retryable status {} from {}", resp.status(), path))
                    } else {
                        self.stats.lock().unwrap().error_count += 1;
                        return Err(EngineError::Fatal(format!(
                            "non-retryable status {} from {}",
                            resp.status(),
                            path
                        )));
                    }
                }
                Ok(Err(e)) => {
                    if is_retryable_transport(&e) {
                        Err(format!("transport error calling {path}: {e}"))
                    } else {
                        self.stats.lock().unwrap().error_count += 1;
                        return Err(EngineError::Fatal(format!(
                            "non-retryable transport error calling {path}: {e}"
                        )));
                    }
                }
            };

            if let Err(msg) = outcome {
                attempt += 1;
                if attempt > self.retry.max_retries {
                    self.stats.lock().unwrap().error_count += 1;
                    error!(path, attempt, "exhausted retries: {}", msg);
                    return Err(EngineError::Transient(format!("exhausted retries: {msg}")));
                }
                let backoff = self.retry.base_delay * 2u32.pow(attempt - 1);
                let backoff = backoff.min(self.retry.max_delay);
                let jitter_frac = rand::thread_rng().gen_range(0.0..0.30);
                let jittered = backoff.mul_f64(1.0 + jitter_frac);
                warn!(path, attempt, delay_ms = jittered.as_millis() as u64, "retrying after error: {}", msg);
                tokio::time::sleep(jittered).await;
                continue;
            }
        }
    }

    pub async fn migration_info(
        &self,
        migration_id: MigrationId,
    ) -> Result<Option<MigrationInfoResponse>, EngineError> {
        self.post_with_retry(
            "/v0/backfilling/migration-info",
            &MigrationInfoRequest { migration_id },
        )
        .await
    }

    pub async fn updates_before(
        &self,
        migration_id: MigrationId,
        synchronizer_id: &str,
        before: DateTime<Utc>,
        at_or_after: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<RawTransactionEnvelope>, EngineError> {
        let resp: Option<TransactionsResponse> = self
            .post_with_retry(
                "/v0/backfilling/updates-before",
                &UpdatesBeforeRequest {
                    migration_id,
                    synchronizer_id: synchronizer_id.to_string(),
                    before,
                    at_or_after,
                    count: count.min(1000),
                },
            )
            .await?;
        Ok(resp.map(|r| r.transactions).unwrap_or_default())
    }

    pub async fn updates_forward(
        &self,
        after: Option<(MigrationId, DateTime<Utc>)>,
        page_size: usize,
    ) -> Result<Vec<RawTransactionEnvelope>, EngineError> {
        let resp: Option<TransactionsResponse> = self
            .post_with_retry(
                "/v2/updates",
                &UpdatesForwardRequest {
                    page_size,
                    after: after.map(|(m, t)| UpdatesAfterCursor {
                        after_migration_id: m,
                        after_record_time: t,
                    }),
                    daml_value_encoding: "compact_json",
                },
            )
            .await?;
        Ok(resp.map(|r| r.transactions).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_set_matches_spec() {
        for code in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn latency_window_caps_at_100_and_computes_percentile() {
        let mut stats = FetchStats::default();
        for ms in 0..150u64 {
            stats.record_latency(Duration::from_millis(ms));
        }
        assert_eq!(stats.latencies.len(), 100);
        assert!(stats.p95_latency_ms() >= stats.avg_latency_ms());
    }
}
