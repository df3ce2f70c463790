use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::info;

use crate::http_client::FetchClient;

pub const TUNE_WINDOW: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
pub struct TunerThresholds {
    pub min: i64,
    pub max: i64,
    pub base: i64,
    pub latency_low_ms: f64,
    pub latency_high_ms: f64,
    pub latency_critical_ms: f64,
}

impl Default for TunerThresholds {
    fn default() -> Self {
        Self {
            min: 2,
            max: 24,
            base: 8,
            latency_low_ms: 500.0,
            latency_high_ms: 2000.0,
            latency_critical_ms: 5000.0,
        }
    }
}

/// Adjusts fetch concurrency based on recent error rate and latency
/// percentiles. `dynamic_parallel_fetches` is mutated only here and read
/// everywhere else via relaxed loads; it's advisory.
pub struct Tuner {
    dynamic_parallel_fetches: AtomicI64,
    thresholds: TunerThresholds,
    stable_windows: AtomicU64,
    cooldown_until: Mutex<Option<Instant>>,
}

impl Tuner {
    pub fn new(thresholds: TunerThresholds) -> Self {
        Self {
            dynamic_parallel_fetches: AtomicI64::new(thresholds.base),
            thresholds,
            stable_windows: AtomicU64::new(0),
            cooldown_until: Mutex::new(None),
        }
    }

    pub fn current(&self) -> i64 {
        self.dynamic_parallel_fetches.load(Ordering::Relaxed)
    }

    fn clamp_and_set(&self, value: i64) {
        let clamped = value.clamp(self.thresholds.min, self.thresholds.max);
        self.dynamic_parallel_fetches.store(clamped, Ordering::Relaxed);
    }

    /// Forces concurrency to 1 and starts a ~60s cooldown window that
    /// overrides the tuner until it elapses.
    pub async fn enter_cooldown(&self, duration: Duration) {
        self.dynamic_parallel_fetches.store(1, Ordering::Relaxed);
        *self.cooldown_until.lock().await = Some(Instant::now() + duration);
    }

    pub async fn in_cooldown(&self) -> bool {
        match *self.cooldown_until.lock().await {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    async fn clear_cooldown_if_expired(&self) -> bool {
        let mut guard = self.cooldown_until.lock().await;
        match *guard {
            Some(until) if Instant::now() >= until => {
                *guard = None;
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// One evaluation window, applying the scaling rules in strict
    /// priority order.
    pub async fn evaluate(&self, client: &FetchClient) {
        if !self.clear_cooldown_if_expired().await {
            // Cooldown still active: the tuner does not touch concurrency.
            client.reset_stats_window();
            return;
        }

        let (success_count, retry503_count, error_count, avg_latency, p95_latency) =
            client.stats_snapshot();
        let old = self.current();

        if error_count > 0 || retry503_count > 0 {
            let step = if error_count > 2 {
                3
            } else if retry503_count >= 3 {
                2
            } else {
                1
            };
            self.clamp_and_set(old - step);
            self.stable_windows.store(0, Ordering::Relaxed);
        } else if p95_latency > self.thresholds.latency_critical_ms
            || avg_latency > self.thresholds.latency_high_ms
        {
            self.clamp_and_set(old - 1);
            self.stable_windows.store(0, Ordering::Relaxed);
        } else if success_count >= 15 && avg_latency < self.thresholds.latency_low_ms {
            let step = if avg_latency < 300.0 { 2 } else { 1 };
            self.clamp_and_set(old + step);
            self.stable_windows.store(0, Ordering::Relaxed);
        } else if success_count >= 20 && avg_latency < self.thresholds.latency_high_ms {
            let windows = self.stable_windows.fetch_add(1, Ordering::Relaxed) + 1;
            if windows >= 2 {
                self.clamp_and_set(old + 1);
                self.stable_windows.store(0, Ordering::Relaxed);
            }
        }

        info!(
            old,
            new = self.current(),
            success_count,
            retry503_count,
            error_count,
            avg_latency,
            p95_latency,
            "auto-tuner evaluated window"
        );
        client.reset_stats_window();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_scales_up_when_errors_present() {
        let client = FetchClient::new("http://localhost".into(), false, Default::default()).unwrap();
        client.inject_stats_for_test(25, 0, 1);
        let tuner = Tuner::new(TunerThresholds::default());
        let before = tuner.current();
        tuner.evaluate(&client).await;
        assert!(tuner.current() <= before);
    }

    #[tokio::test]
    async fn scales_down_more_on_503_storm() {
        let client = FetchClient::new("http://localhost".into(), false, Default::default()).unwrap();
        client.inject_stats_for_test(10, 4, 0);
        let tuner = Tuner::new(TunerThresholds::default());
        let before = tuner.current();
        tuner.evaluate(&client).await;
        assert_eq!(tuner.current(), before - 2);
    }

    #[test]
    fn bounds_never_exceeded() {
        let tuner = Tuner::new(TunerThresholds::default());
        tuner.clamp_and_set(1000);
        assert_eq!(tuner.current(), 24);
        tuner.clamp_and_set(-1000);
        assert_eq!(tuner.current(), 2);
    }

    #[tokio::test]
    async fn cooldown_forces_minimum_and_blocks_scale_up() {
        let tuner = Tuner::new(TunerThresholds::default());
        tuner.enter_cooldown(Duration::from_secs(60)).await;
        assert_eq!(tuner.current(), 1);
        assert!(tuner.in_cooldown().await);
    }
}
