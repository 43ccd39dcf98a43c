//! URL-keyed response caching.
//!
//! This module provides the `ResponseCache`, a memoizing wrapper around
//! `ApiClient` for idempotent read endpoints. Entries never expire on
//! their own; staleness is managed by the caller through forced refresh
//! and pattern invalidation.

pub mod manager;

pub use manager::ResponseCache;
