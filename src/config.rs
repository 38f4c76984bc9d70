use crate::headers::HeaderFilter;
use crate::util::{MirrorError, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// what to do with a body larger than `max_content_size`
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizePolicy {
    /// cut the body down to the limit, then cache and serve the cut body
    Truncate,
    /// serve the full body but keep it out of the cache
    SkipCache,
}

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    #[clap(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// cache ttl, also advertised to clients via max-age
    #[clap(long, env = "CACHE_TTL_SECONDS", default_value_t = 3600)]
    pub cache_ttl_seconds: u64,

    /// max cache size in mb
    #[clap(long, env = "CACHE_SIZE_MB", default_value_t = 100)]
    pub cache_size_mb: u64,

    /// largest body (after rewriting) that is cached as-is
    #[clap(long, env = "MAX_CONTENT_SIZE", default_value_t = 1_000_000)]
    pub max_content_size: usize,

    #[clap(long, env = "OVERSIZE_POLICY", value_enum, default_value_t = OversizePolicy::Truncate)]
    pub oversize_policy: OversizePolicy,

    #[clap(long, env = "FETCH_TIMEOUT_SECONDS", default_value_t = 30)]
    pub fetch_timeout_seconds: u64,

    /// hard cap on bytes read from an origin, in mb
    #[clap(long, env = "FETCH_LIMIT_MB", default_value_t = 16)]
    pub fetch_limit_mb: usize,

    /// debug mode: no max-age header on mirrored responses
    #[clap(long, env = "MIRROR_DEBUG")]
    pub debug: bool,

    /// host names this mirror is served under; requests to mirror them are refused
    #[clap(
        long,
        env = "MIRROR_HOSTS",
        value_delimiter = ',',
        default_value = "localhost,127.0.0.1"
    )]
    pub mirror_hosts: Vec<String>,

    /// tls cert path
    #[clap(long = "tls-cert", env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    /// tls key path
    #[clap(long = "tls-key", env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl_seconds == 0 {
            return Err(MirrorError::Config("cache ttl must be positive".to_string()));
        }
        if self.max_content_size == 0 {
            return Err(MirrorError::Config(
                "max content size must be positive".to_string(),
            ));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(MirrorError::Config(
                "fetch timeout must be positive".to_string(),
            ));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(MirrorError::Config(
                "tls needs both a cert and a key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (self.tls_cert_path.as_deref(), self.tls_key_path.as_deref()) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn fetch_limit_bytes(&self) -> usize {
        self.fetch_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn mirror_options(&self) -> MirrorOptions {
        MirrorOptions {
            cache_ttl: Duration::from_secs(self.cache_ttl_seconds),
            max_content_size: self.max_content_size,
            oversize_policy: self.oversize_policy,
            debug: self.debug,
            ..MirrorOptions::default()
        }
    }
}

/// immutable settings shared by the cache coordinator and the pipeline
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub cache_ttl: Duration,
    pub max_content_size: usize,
    pub oversize_policy: OversizePolicy,
    pub debug: bool,
    pub header_filter: HeaderFilter,
    /// content-type prefixes whose bodies get their links rewritten
    pub rewritable_types: Vec<String>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            max_content_size: 1_000_000,
            oversize_policy: OversizePolicy::Truncate,
            debug: false,
            header_filter: HeaderFilter::default(),
            rewritable_types: vec!["text/html".to_string(), "text/css".to_string()],
        }
    }
}

impl MirrorOptions {
    /// prefix match so `text/html; charset=utf-8` still counts
    pub fn is_rewritable(&self, content_type: &str) -> bool {
        let content_type = content_type.trim_start().to_ascii_lowercase();
        self.rewritable_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}
