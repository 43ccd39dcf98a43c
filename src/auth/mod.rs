//! Authentication token storage.
//!
//! This module provides `TokenStore`, the process-wide holder of the
//! access/refresh token pair. Tokens are persisted through a
//! `KeyValueStore` so sessions survive application restarts.
//!
//! The pair is mutated only by login and refresh flows (`set_*`,
//! `store_pair`) and by explicit logout (`clear`).

pub mod tokens;

pub use tokens::TokenStore;
