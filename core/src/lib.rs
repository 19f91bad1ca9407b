//! Two-tier image cache with de-duplicated background downloads.

#![deny(missing_debug_implementations)]

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod image_cache;
pub mod log;
pub mod stats;
pub mod types;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

pub use config::ImageCacheConfig;
pub use download::{FetchError, Fetcher, HandleState, HttpFetcher, ImageHandle};
pub use error::CacheError;
pub use image_cache::{ImageCache, PruneReport};
pub use stats::CacheStatsSnapshot;
pub use types::{CacheKey, ImageData};

/// Returns the version of the core crate for telemetry and debugging.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
