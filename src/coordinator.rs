use crate::cache::{CacheKey, MirrorCache, MirroredContent, StoreOutcome};
use crate::config::{MirrorOptions, OversizePolicy};
use crate::fetcher::Fetch;
use crate::transform::Rewriter;
use crate::util::FetchError;
use bytes::Bytes;
use log::{debug, error, warn};
use std::sync::Arc;

/// owns the cache store and fills it on a miss.
///
/// no lock is held across the fetch. two misses for the same key both fetch
/// and rewrite; the first to store wins and the other keeps its own copy.
pub struct CacheCoordinator {
    store: MirrorCache,
    fetcher: Arc<dyn Fetch>,
    rewriter: Arc<Rewriter>,
    options: Arc<MirrorOptions>,
}

impl CacheCoordinator {
    pub fn new(
        store: MirrorCache,
        fetcher: Arc<dyn Fetch>,
        rewriter: Arc<Rewriter>,
        options: Arc<MirrorOptions>,
    ) -> Self {
        Self {
            store,
            fetcher,
            rewriter,
            options,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Arc<MirroredContent>> {
        self.store.get(key).await
    }

    pub fn entry_count(&self) -> u64 {
        self.store.len()
    }

    /// fetches, filters, rewrites and stores. `None` means not found: the fetch
    /// failed or was refused as recursive.
    pub async fn populate(
        &self,
        key: &CacheKey,
        base_host: &str,
        translated_address: &str,
        origin_url: &str,
        recursive: bool,
    ) -> Option<Arc<MirroredContent>> {
        debug!("fetching '{}'", origin_url);
        let response = match self.fetcher.fetch(origin_url, recursive).await {
            Ok(response) => response,
            Err(FetchError::RecursionRejected(url)) => {
                warn!("encountered recursive request for '{}'; ignoring", url);
                return None;
            }
            Err(e) => {
                error!("could not fetch '{}': {}", origin_url, e);
                return None;
            }
        };

        let (parts, body) = response.into_parts();
        let headers = self.options.header_filter.filter_map(&parts.headers);

        let content_type = headers.get("content-type").map_or("", String::as_str);
        let body = if self.options.is_rewritable(content_type) {
            match self.rewriter.rewrite_document(base_host, origin_url, &body) {
                Ok(rewritten) => Bytes::from(rewritten),
                Err(e) => {
                    warn!("serving '{}' unrewritten: {}", origin_url, e);
                    body
                }
            }
        } else {
            body
        };

        let (body, cacheable) = self.apply_size_policy(origin_url, body);

        let content = Arc::new(MirroredContent {
            original_address: origin_url.to_string(),
            translated_address: translated_address.to_string(),
            status: parts.status.as_u16(),
            headers,
            body,
            base_host: base_host.to_string(),
        });

        let outcome = if cacheable {
            self.store.add(key, content.clone()).await
        } else {
            StoreOutcome::SkippedOversize
        };
        match outcome {
            StoreOutcome::Stored => debug!("cached '{}' as {}", origin_url, key),
            StoreOutcome::WriteLost => error!(
                "cache add failed: key = '{}', original_url = '{}'",
                key, origin_url
            ),
            StoreOutcome::SkippedOversize => debug!("not caching oversized '{}'", origin_url),
        }

        Some(content)
    }

    /// returns the body to keep and whether it may be cached
    fn apply_size_policy(&self, origin_url: &str, body: Bytes) -> (Bytes, bool) {
        let limit = self.options.max_content_size;
        if body.len() <= limit {
            return (body, true);
        }
        match self.options.oversize_policy {
            OversizePolicy::Truncate => {
                warn!(
                    "content for '{}' is {} bytes, over {}; truncating",
                    origin_url,
                    body.len(),
                    limit
                );
                (body.slice(..limit), true)
            }
            OversizePolicy::SkipCache => {
                warn!(
                    "content for '{}' is {} bytes, over {}; serving uncached",
                    origin_url,
                    body.len(),
                    limit
                );
                (body, false)
            }
        }
    }
}
