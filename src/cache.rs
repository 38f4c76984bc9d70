use crate::headers::HeaderFields;
use bytes::Bytes;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// a mirrored page as fetched, filtered and rewritten. never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredContent {
    /// absolute origin url
    pub original_address: String,
    /// the same resource as exposed by the mirror
    pub translated_address: String,
    pub status: u16,
    pub headers: HeaderFields,
    pub body: Bytes,
    pub base_host: String,
}

impl MirroredContent {
    /// approximate footprint, used to weigh entries against the cache capacity
    fn weight(&self) -> u32 {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        let total = self.body.len()
            + headers
            + self.original_address.len()
            + self.translated_address.len()
            + self.base_host.len();
        u32::try_from(total).unwrap_or(u32::MAX)
    }
}

/// namespaced sha256 of an origin url
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub const NAMESPACE: &'static str = "hash_";

    pub fn for_url(origin_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(origin_url.as_bytes());
        CacheKey(format!("{}{}", Self::NAMESPACE, hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// how a store attempt ended; none of these are errors for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// another writer got there first, or the entry was refused
    WriteLost,
    /// too large to cache under the configured policy
    SkippedOversize,
}

/// shared ttl store of mirrored content
pub struct MirrorCache {
    cache: Cache<String, Arc<MirroredContent>>,
}

impl MirrorCache {
    /// capacity is in mb of weighed content; entries expire `ttl` after insertion
    pub fn new(size_mb: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(size_mb.saturating_mul(1024 * 1024))
            .weigher(|_key: &String, value: &Arc<MirroredContent>| value.weight())
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Arc<MirroredContent>> {
        self.cache.get(key.as_str()).await
    }

    /// add-if-absent: an existing live entry is never replaced
    pub async fn add(&self, key: &CacheKey, content: Arc<MirroredContent>) -> StoreOutcome {
        let entry = self
            .cache
            .entry(key.as_str().to_string())
            .or_insert(content)
            .await;
        if entry.is_fresh() {
            StoreOutcome::Stored
        } else {
            StoreOutcome::WriteLost
        }
    }

    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }
}
