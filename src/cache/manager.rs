//! Memoizing fetch wrapper keyed by request URL.
//!
//! The cache stores whatever `ApiClient::fetch` returned - success
//! envelopes and error-shaped values alike. Callers that need fresh data
//! after a known failure pass `force_refresh`. Two requests that differ
//! only in query string are distinct entries: the key is the literal URL
//! path handed to `fetch`, so cached endpoints must be idempotent reads.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::api::{ApiClient, FetchResult, RequestOptions};

#[derive(Debug, Clone)]
struct CacheEntry {
    result: FetchResult,
    cached_at: DateTime<Utc>,
}

/// URL-keyed cache over an `ApiClient`.
/// Clone is cheap - the entry map is shared.
#[derive(Clone)]
pub struct ResponseCache {
    client: ApiClient,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl ResponseCache {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Fetch through the cache.
    ///
    /// A hit (and no `force_refresh`) returns the stored value with no
    /// network call, including previously-cached error results. A miss
    /// or forced refresh delegates to the client and stores whatever
    /// comes back. Concurrent misses on the same URL may both fetch;
    /// the last write wins.
    pub async fn fetch(
        &self,
        url: &str,
        options: RequestOptions,
        use_auth: bool,
        force_refresh: bool,
    ) -> FetchResult {
        if !force_refresh {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(url) {
                debug!(url, "Cache hit");
                return entry.result.clone();
            }
        }

        let result = self.client.fetch(url, options, use_auth).await;

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            url.to_string(),
            CacheEntry {
                result: result.clone(),
                cached_at: Utc::now(),
            },
        );

        result
    }

    /// Whether an entry exists for the exact URL
    pub fn is_cached(&self, url: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(url)
    }

    /// When the entry for the exact URL was stored, if it exists.
    /// Entries never expire on their own; this is caller-side metadata.
    pub fn cached_at(&self, url: &str) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .map(|entry| entry.cached_at)
    }

    /// Remove entries. `None` clears everything; `Some(pattern)` removes
    /// every key matching the pattern, where `*` matches any run of
    /// characters (e.g. `/groups/*` removes `/groups/5` and
    /// `/groups/5/invited`).
    pub fn invalidate(&self, pattern: Option<&str>) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match pattern {
            None => {
                let removed = entries.len();
                entries.clear();
                debug!(removed, "Cache fully invalidated");
            }
            Some(pattern) => {
                let before = entries.len();
                entries.retain(|key, _| !pattern_matches(pattern, key));
                debug!(pattern, removed = before - entries.len(), "Cache invalidated by pattern");
            }
        }
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Match a key against a glob where `*` is the only metacharacter.
/// Deliberately not a general glob engine - `*` covers the observed need.
fn pattern_matches(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            if !key.starts_with(segment) {
                return false;
            }
            pos = segment.len();
        } else if i == segments.len() - 1 {
            let rest = &key[pos..];
            if !rest.ends_with(segment) {
                return false;
            }
        } else {
            match key[pos..].find(segment) {
                Some(offset) => pos += offset + segment.len(),
                None => return false,
            }
        }
    }

    true
}

// ============================================================================
// Tests
// ============================================================================
