use http::HeaderMap;
use std::collections::{BTreeMap, HashSet};

/// headers never re-emitted to mirror clients: cookies, origin caching
/// directives, and the hop-by-hop set.
pub const IGNORED_HEADERS: &[&str] = &[
    "set-cookie",
    "expires",
    "cache-control",
    // hop-by-hop
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// lower-cased header name -> value, one value per name
pub type HeaderFields = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct HeaderFilter {
    ignored: HashSet<String>,
}

impl Default for HeaderFilter {
    fn default() -> Self {
        Self::new(IGNORED_HEADERS.iter().copied())
    }
}

impl HeaderFilter {
    pub fn new<I, S>(ignored: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ignored: ignored
                .into_iter()
                .map(|name| name.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored.contains(&name.to_ascii_lowercase())
    }

    /// keeps every header not in the ignored set. keys come out lower-cased and
    /// a later duplicate replaces an earlier one.
    pub fn filter<'a, I>(&self, raw: I) -> HeaderFields
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut safe = HeaderFields::new();
        for (name, value) in raw {
            if self.is_ignored(name) {
                continue;
            }
            let name = name.to_ascii_lowercase();
            safe.insert(name, String::from_utf8_lossy(value).into_owned());
        }
        safe
    }

    pub fn filter_map(&self, headers: &HeaderMap) -> HeaderFields {
        self.filter(
            headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_bytes())),
        )
    }
}
