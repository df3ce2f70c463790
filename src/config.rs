use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Process configuration, loaded the way `arch-indexer`'s `Settings` is:
/// a typed struct deserialized from the environment, with `set_default`
/// calls covering every documented default.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub scan_url: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_parallel_fetches")]
    pub parallel_fetches: usize,
    #[serde(default = "default_min_parallel_fetches")]
    pub min_parallel_fetches: usize,
    #[serde(default = "default_max_parallel_fetches")]
    pub max_parallel_fetches: usize,

    #[serde(default = "default_latency_low_ms")]
    pub latency_low_ms: u64,
    #[serde(default = "default_latency_high_ms")]
    pub latency_high_ms: u64,
    #[serde(default = "default_latency_critical_ms")]
    pub latency_critical_ms: u64,

    #[serde(default = "default_flush_every_batches")]
    pub flush_every_batches: u64,

    #[serde(default = "default_shard_index")]
    pub shard_index: u32,
    #[serde(default = "default_shard_total")]
    pub shard_total: u32,

    pub target_migration: Option<u32>,

    #[serde(default = "default_cursor_dir")]
    pub cursor_dir: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,

    #[serde(default = "default_heap_pressure_threshold")]
    pub heap_pressure_threshold: f64,

    #[serde(default = "default_gcs_checkpoint_interval")]
    pub gcs_checkpoint_interval: u64,

    #[serde(default)]
    pub insecure_tls: bool,

    #[serde(default = "default_rows_per_file")]
    pub rows_per_file: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_writer_workers")]
    pub writer_workers: usize,
}

fn default_batch_size() -> usize {
    1000
}
fn default_parallel_fetches() -> usize {
    8
}
fn default_min_parallel_fetches() -> usize {
    2
}
fn default_max_parallel_fetches() -> usize {
    24
}
fn default_latency_low_ms() -> u64 {
    500
}
fn default_latency_high_ms() -> u64 {
    2000
}
fn default_latency_critical_ms() -> u64 {
    5000
}
fn default_flush_every_batches() -> u64 {
    5
}
fn default_shard_index() -> u32 {
    0
}
fn default_shard_total() -> u32 {
    1
}
fn default_cursor_dir() -> String {
    "./cursors".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_stall_threshold_ms() -> u64 {
    120_000
}
fn default_heap_pressure_threshold() -> f64 {
    0.80
}
fn default_gcs_checkpoint_interval() -> u64 {
    50
}
fn default_rows_per_file() -> usize {
    100_000
}
fn default_chunk_size() -> usize {
    2000
}
fn default_writer_workers() -> usize {
    4
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(Environment::default().separator("__"))
            .set_default("batch_size", default_batch_size() as i64)?
            .set_default("parallel_fetches", default_parallel_fetches() as i64)?
            .set_default("min_parallel_fetches", default_min_parallel_fetches() as i64)?
            .set_default("max_parallel_fetches", default_max_parallel_fetches() as i64)?
            .set_default("latency_low_ms", default_latency_low_ms() as i64)?
            .set_default("latency_high_ms", default_latency_high_ms() as i64)?
            .set_default("latency_critical_ms", default_latency_critical_ms() as i64)?
            .set_default("flush_every_batches", default_flush_every_batches() as i64)?
            .set_default("shard_index", default_shard_index() as i64)?
            .set_default("shard_total", default_shard_total() as i64)?
            .set_default("cursor_dir", default_cursor_dir())?
            .set_default("data_dir", default_data_dir())?
            .set_default("poll_interval_secs", default_poll_interval_secs() as i64)?
            .set_default("stall_threshold_ms", default_stall_threshold_ms() as i64)?
            .set_default("heap_pressure_threshold", default_heap_pressure_threshold())?
            .set_default("gcs_checkpoint_interval", default_gcs_checkpoint_interval() as i64)?
            .set_default("insecure_tls", false)?
            .set_default("rows_per_file", default_rows_per_file() as i64)?
            .set_default("chunk_size", default_chunk_size() as i64)?
            .set_default("writer_workers", default_writer_workers() as i64)?
            .build()?;

        config.try_deserialize()
    }
}
