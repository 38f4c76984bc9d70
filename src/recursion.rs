//! loop detection for requests that would make the mirror fetch itself.
//!
//! this is a heuristic: it only knows the host names it was told about and
//! the markers our own fetcher leaves on outbound requests.

use crate::fetcher::MIRROR_USER_AGENT_TOKEN;
use std::collections::HashSet;

/// what the server could observe about an inbound request
#[derive(Debug, Clone, Default)]
pub struct InboundSignals {
    /// first path segment, the host about to be mirrored
    pub base_host: String,
    pub user_agent: Option<String>,
    /// the request carried the hop header our fetcher stamps
    pub hop_marker: bool,
}

pub trait RecursionGuard: Send + Sync {
    fn is_recursive(&self, signals: &InboundSignals) -> bool;
}

/// treats the mirror's own host names and its own fetcher as loops
#[derive(Debug, Clone)]
pub struct MirrorHostGuard {
    hosts: HashSet<String>,
}

impl MirrorHostGuard {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|host| normalize_host(host.as_ref()))
                .filter(|host| !host.is_empty())
                .collect(),
        }
    }
}

impl RecursionGuard for MirrorHostGuard {
    fn is_recursive(&self, signals: &InboundSignals) -> bool {
        if signals.hop_marker {
            return true;
        }
        if signals
            .user_agent
            .as_deref()
            .map_or(false, |agent| agent.contains(MIRROR_USER_AGENT_TOKEN))
        {
            return true;
        }
        self.hosts.contains(&normalize_host(&signals.base_host))
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.');
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    without_port.to_ascii_lowercase()
}
