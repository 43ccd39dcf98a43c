//! Resilient HTTP access layer for the Wishstash backend.
//!
//! This module provides the `ApiClient` for issuing authenticated
//! requests. A 401 triggers a single coordinated token refresh and one
//! retry; transport and server failures are returned as `FetchResult`
//! values so call sites never have to catch anything.
//!
//! The backend wraps responses in a `{ success, data, error }` envelope
//! which passes through this layer untouched.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, FetchResult, RequestOptions};
pub use error::ApiError;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
