//! # Lapse Core
//!
//! An in-memory key/value cache where every entry carries its own expiration
//! timer.
//!
//! ## Features
//!
//! - One actor task per key owns the value, its timer and its read/write ports
//! - Per-entry TTLs, persistent entries with [`Expiry::Never`]
//! - Optional extend-on-read: every successful read rearms the entry's timer
//! - Expired entries remove themselves; there is no background sweep
//! - Deterministic teardown through [`tokio_util::sync::CancellationToken`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use lapse_core::{Cache, CacheConfig, Expiry};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lapse_core::CacheError> {
//!     let shutdown = CancellationToken::new();
//!
//!     // Entries live 60 seconds unless read again
//!     let config = CacheConfig::default()
//!         .with_default_ttl(Duration::from_secs(60))
//!         .with_extend_on_read(true);
//!     let cache = Cache::with_config(Some(shutdown.clone()), config);
//!
//!     cache.set("session:42".to_string(), "alice".to_string()).await?;
//!     cache.set_ttl("motd".to_string(), "hello".to_string(), Expiry::Never).await?;
//!
//!     if let Some(user) = cache.get(&"session:42".to_string()).await {
//!         println!("User: {}", user);
//!     }
//!
//!     cache.delete(&"motd".to_string());
//!
//!     // Tears down every entry; later writes fail with CacheError::Canceled
//!     shutdown.cancel();
//!     Ok(())
//! }
//! ```

mod cache;
mod config;
mod entry;
mod error;
mod table;
mod timer;

pub use cache::Cache;
pub use config::{CacheConfig, DEFAULT_PORT_CAPACITY};
pub use entry::Expiry;
pub use error::CacheError;
