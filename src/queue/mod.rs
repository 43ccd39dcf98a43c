//! Offline-tolerant batching queue for viewed-item telemetry.
//!
//! This module provides the `ViewedItemQueue`: viewed-item ids are
//! persisted as they arrive and drained by a periodic batched write.
//! Delivery is fail-open - a failed batch is dropped rather than retried,
//! trading delivery guarantees for UI availability.

pub mod viewed;

pub use viewed::{ItemId, NoopEvents, QueueEvents, QueueSignal, QueueStatus, ViewedItemQueue};
