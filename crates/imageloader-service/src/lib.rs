//! Asynchronous image loading.
//!
//! The service is split into three layers that are wired together by the [`ImageManager`]:
//!
//! - [`caching`]: a two-tier cache, keeping decoded images in a cost and count bounded memory
//!   tier backed by an age and size bounded disk tier.
//! - [`download`]: a coalescing downloader that runs at most one fetch per URL and fans out
//!   progress and completion to every interested caller.
//! - [`manager`]: the per-call-site facade that consults the cache, falls back to the
//!   downloader, remembers permanently failing URLs and tracks all outstanding requests.
//!
//! Every caller visible callback is invoked on a single [`Delivery`] context.
//!
//! [`ImageManager`]: manager::ImageManager
//! [`Delivery`]: delivery::Delivery

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod delivery;
pub mod download;
pub mod error;
pub mod logging;
pub mod manager;
pub mod types;
pub mod utils;
