use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::storage::KeyValueStore;

/// Storage key for the access token
const ACCESS_TOKEN_KEY: &str = "auth/access_token";

/// Storage key for the refresh token
const REFRESH_TOKEN_KEY: &str = "auth/refresh_token";

/// Durable holder of the access/refresh token pair.
///
/// Clone is cheap - the underlying store is shared via `Arc`, so every
/// clone observes the same tokens. Reads degrade to `None` on storage
/// errors rather than failing the request that asked for them.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Current access token, if one is stored
    pub fn access_token(&self) -> Option<String> {
        match self.store.get(ACCESS_TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read access token");
                None
            }
        }
    }

    /// Current refresh token, if one is stored
    pub fn refresh_token(&self) -> Option<String> {
        match self.store.get(REFRESH_TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read refresh token");
                None
            }
        }
    }

    /// Replace the access token (successful refresh)
    pub fn set_access_token(&self, token: &str) -> Result<()> {
        self.store.set(ACCESS_TOKEN_KEY, token)
    }

    /// Replace the refresh token
    pub fn set_refresh_token(&self, token: &str) -> Result<()> {
        self.store.set(REFRESH_TOKEN_KEY, token)
    }

    /// Store both tokens at once (successful login)
    pub fn store_pair(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        self.set_access_token(access_token)?;
        self.set_refresh_token(refresh_token)
    }

    /// Remove both tokens (logout)
    pub fn clear(&self) -> Result<()> {
        self.store.remove(ACCESS_TOKEN_KEY)?;
        self.store.remove(REFRESH_TOKEN_KEY)
    }

    /// Whether an access token is currently stored
    pub fn has_access_token(&self) -> bool {
        self.access_token().is_some()
    }
}
