//! Client access layer for the Wishstash wishlist application.
//!
//! The UI talks to the backend exclusively through this crate:
//! - [`ApiClient`]: authenticated fetch with a single coordinated
//!   token-refresh retry on 401, errors returned as values
//! - [`ResponseCache`]: URL-keyed memoization with glob invalidation
//! - [`ViewedItemQueue`]: durable batched queue for viewed-item telemetry
//!
//! Tokens and queued ids are persisted through [`storage::KeyValueStore`]
//! so they survive application restarts.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod queue;
pub mod storage;

pub use api::{ApiClient, ApiError, FetchResult, RequestOptions};
pub use auth::TokenStore;
pub use cache::ResponseCache;
pub use config::Config;
pub use queue::{ItemId, NoopEvents, QueueEvents, QueueSignal, QueueStatus, ViewedItemQueue};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
