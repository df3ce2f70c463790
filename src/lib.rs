pub mod backfill;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalize;
pub mod partition;
pub mod slice;
pub mod tailer;
pub mod tuner;
pub mod writer;
