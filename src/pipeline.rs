use crate::cache::{CacheKey, MirroredContent};
use crate::config::MirrorOptions;
use crate::coordinator::CacheCoordinator;
use crate::headers::HeaderFields;
use crate::recursion::{InboundSignals, RecursionGuard};
use bytes::Bytes;
use log::{debug, info};
use std::sync::Arc;

/// origins are always fetched over plain http, as the mirrored path carries no scheme
pub const ORIGIN_SCHEME: &str = "http://";

/// what the response layer renders for a mirrored url
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorResponse {
    pub status: u16,
    pub headers: HeaderFields,
    pub body: Bytes,
    pub cache_hit: bool,
}

pub struct MirrorPipeline {
    coordinator: CacheCoordinator,
    guard: Arc<dyn RecursionGuard>,
    options: Arc<MirrorOptions>,
}

impl MirrorPipeline {
    pub fn new(
        coordinator: CacheCoordinator,
        guard: Arc<dyn RecursionGuard>,
        options: Arc<MirrorOptions>,
    ) -> Self {
        Self {
            coordinator,
            guard,
            options,
        }
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    /// serves `translated_address` (the request path without its leading `/`)
    /// from cache or origin. `None` is the not-found outcome.
    pub async fn handle(
        &self,
        base_host: &str,
        translated_address: &str,
        signals: &InboundSignals,
    ) -> Option<MirrorResponse> {
        let origin_url = format!("{}{}", ORIGIN_SCHEME, translated_address);
        let key = CacheKey::for_url(&origin_url);
        info!("handling request for '{}' = '{}'", origin_url, key);

        if let Some(content) = self.coordinator.get(&key).await {
            debug!("cache hit for '{}'", origin_url);
            return Some(self.respond(&content, true));
        }

        debug!("cache miss for '{}'", origin_url);
        let recursive = self.guard.is_recursive(signals);
        let content = self
            .coordinator
            .populate(&key, base_host, translated_address, &origin_url, recursive)
            .await?;
        Some(self.respond(&content, false))
    }

    fn respond(&self, content: &MirroredContent, cache_hit: bool) -> MirrorResponse {
        let mut headers = content.headers.clone();
        if !self.options.debug {
            headers.insert(
                "cache-control".to_string(),
                format!("max-age={}", self.options.cache_ttl.as_secs()),
            );
        }
        MirrorResponse {
            status: content.status,
            headers,
            body: content.body.clone(),
            cache_hit,
        }
    }
}
