//! # In-memory caching
//!
//! Every upstream call of drivemirror goes through a [`MemoCache`]: access tokens,
//! file metadata, folder listings, searches and the download rankings.
//!
//! A [`MemoCache`] does three things at once:
//!
//! - It remembers successful results until their deadline passes.
//! - It coalesces concurrent requests for the same key, so only one computation is running
//!   per key at any time and all callers observe its outcome.
//! - It optionally bounds the number of computations running at the same time.
//!
//! Failures are handed to every caller waiting on the computation, but are never remembered.
//! The next call for the same key starts a fresh computation.
//!
//! Values live in a [`moka::future::Cache`], which also does the coalescing. A computation is
//! driven by the caller that started it. If that caller is dropped, for example because an HTTP
//! client disconnected, the computation is dropped too and releases its concurrency permit.
//!
//! ### Metrics
//!
//! All metrics are tagged with a `cache` field naming the cache:
//!
//! - `caches.memory.hit`: Accesses served by a live entry.
//! - `caches.memory.coalesced`: Accesses that joined a running computation.
//! - `caches.computation`: Computations actually being started.
//! - `caches.computation.duration`: Time a computation took, including waiting for a permit.
//! - `caches.computation.error`: Computations that failed.

mod memo;

pub use memo::MemoCache;
