use crate::config::Config;
use crate::util::FetchError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{ACCEPT_ENCODING, LOCATION, USER_AGENT};
use http::{Method, Request, Response, Uri};
use hyper::client::HttpConnector;
use hyper::{Body, Client as HyperClient};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const MIRROR_USER_AGENT_TOKEN: &str = "mirror-proxy";

/// stamped on every outbound request so a mirror fetching itself can tell
pub const HOP_HEADER: &str = "x-mirror-hop";

/// redirects followed before giving up on an origin
pub const MAX_REDIRECTS: usize = 5;

/// outbound retrieval of an origin url.
///
/// any http status counts as success; only transport-level failures are errors.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch_origin(&self, url: &str) -> Result<Response<Bytes>, FetchError>;

    /// refuses without touching the network when the caller flagged the
    /// request as coming from the mirror itself
    async fn fetch(&self, url: &str, recursive: bool) -> Result<Response<Bytes>, FetchError> {
        if recursive {
            return Err(FetchError::RecursionRejected(url.to_string()));
        }
        self.fetch_origin(url).await
    }
}

#[derive(Clone)]
pub struct OriginFetcher {
    client: Arc<HyperClient<HttpsConnector<HttpConnector>>>,
    timeout: Duration,
    body_limit: usize,
}

impl OriginFetcher {
    pub fn new(config: &Config) -> Self {
        Self::with_limits(config.fetch_timeout(), config.fetch_limit_bytes())
    }

    pub fn with_limits(timeout: Duration, body_limit: usize) -> Self {
        // origins may be plain http or https
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        Self {
            client: Arc::new(HyperClient::builder().build(https)),
            timeout,
            body_limit,
        }
    }

    async fn round_trip(&self, url: &str) -> Result<Response<Bytes>, FetchError> {
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        log::debug!("fetching from origin: {}", uri);

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(
                USER_AGENT,
                concat!("mirror-proxy/", env!("CARGO_PKG_VERSION")),
            )
            .header(HOP_HEADER, "1")
            // bodies get rewritten, so ask for them uncompressed
            .header(ACCEPT_ENCODING, "identity")
            .body(Body::empty())
            .map_err(|e| FetchError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let (parts, mut body) = response.into_parts();
        let mut collected = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
            if collected.len() + chunk.len() > self.body_limit {
                return Err(FetchError::BodyTooLarge {
                    url: url.to_string(),
                    limit: self.body_limit,
                });
            }
            collected.extend_from_slice(&chunk);
        }

        Ok(Response::from_parts(parts, collected.freeze()))
    }

    /// the origin answers with its final page, so clients never see a
    /// `location` pointing off the mirror
    async fn follow_redirects(&self, url: &str) -> Result<Response<Bytes>, FetchError> {
        let mut current = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let response = self.round_trip(&current).await?;
            let Some(next) = redirect_target(&current, &response)? else {
                return Ok(response);
            };
            log::debug!("following {} redirect {} -> {}", response.status(), current, next);
            current = next;
        }
        Err(FetchError::TooManyRedirects {
            url: url.to_string(),
            limit: MAX_REDIRECTS,
        })
    }
}

/// the absolute url a redirect response points at, resolved against the
/// url that produced it
fn redirect_target(
    current: &str,
    response: &Response<Bytes>,
) -> Result<Option<String>, FetchError> {
    // 304 and 300 carry no single target to follow
    if !matches!(response.status().as_u16(), 301 | 302 | 303 | 307 | 308) {
        return Ok(None);
    }
    let Some(location) = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };
    let invalid = |reason: String| FetchError::InvalidUrl {
        url: location.to_string(),
        reason,
    };
    let base = Url::parse(current).map_err(|e| invalid(e.to_string()))?;
    let next = base.join(location).map_err(|e| invalid(e.to_string()))?;
    Ok(Some(next.to_string()))
}

#[async_trait]
impl Fetch for OriginFetcher {
    async fn fetch_origin(&self, url: &str) -> Result<Response<Bytes>, FetchError> {
        tokio::time::timeout(self.timeout, self.follow_redirects(url))
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            })?
    }
}
