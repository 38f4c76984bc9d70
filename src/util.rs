use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("rewrite rule failed to compile: {0}")]
    Regex(#[from] regex::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tls configuration error: {0}")]
    TlsConfig(String),
}

pub type Result<T> = std::result::Result<T, MirrorError>;

/// failures of a single outbound origin retrieval. none of these are fatal to
/// the server; the pipeline turns every one of them into a not-found response.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("transport error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: hyper::Error,
    },

    #[error("invalid origin url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{url} redirected more than {limit} times")]
    TooManyRedirects { url: String, limit: usize },

    #[error("origin body for {url} exceeded {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },

    #[error("recursive mirror request for {0} rejected")]
    RecursionRejected(String),
}

pub fn setup_logger() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
}
