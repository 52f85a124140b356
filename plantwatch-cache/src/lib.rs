//! PlantWatch Cache
//!
//! In-memory store of request results keyed by resource kind, tenant, and
//! request parameters. The store owns freshness bookkeeping, invalidation,
//! fetch sequencing, and change notification; it performs no I/O itself.
//!
//! # Fetch sequencing
//!
//! ```ignore
//! let seq = store.begin_fetch(&key);
//! let result = transport.send(request).await;
//! // Discarded if a newer fetch for the same key already landed.
//! store.complete_fetch(&key, seq, result, ttl);
//! ```

mod config;
mod entry;
mod key;
mod store;
mod subscription;

pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryStatus};
pub use key::{CacheKey, KeyFilter, ParamValue, Scalar};
pub use store::{CacheStats, CacheStore, FetchOutcome};
pub use subscription::Subscription;
