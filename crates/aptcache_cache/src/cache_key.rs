use std::fmt::{Display, Formatter};

/// The scheme half of a [`CacheKey`] — HTTP and HTTPS resources with the
/// same host and path are distinct cache identities (spec.md §3).
#[derive(Debug, Hash, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub enum Protocol {
    /// Plain HTTP.
    Http,
    /// TLS-terminated HTTPS.
    Https,
}

impl Protocol {
    /// Parses a URL scheme string (`"http"`/`"https"`) into a [`Protocol`].
    /// Any other scheme is treated as HTTP, matching the dispatcher's
    /// "set `url.scheme` from TLS state if absent" fallback.
    pub fn from_scheme(scheme: &str) -> Self {
        if scheme.eq_ignore_ascii_case("https") {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    /// The scheme string for this protocol.
    pub fn as_scheme(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// The sidecar's `protocol` integer: `0` for HTTP, `1` for HTTPS. A
    /// sidecar missing a `url` field is repaired by assuming HTTP unless
    /// this field says otherwise (spec.md §4.6).
    pub fn as_index(self) -> u8 {
        match self {
            Protocol::Http => 0,
            Protocol::Https => 1,
        }
    }

    /// Inverse of [`Protocol::as_index`].
    pub fn from_index(index: u8) -> Self {
        if index == 1 {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }
}

/// Identifies one cacheable object: `(protocol, host, url-path)`.
///
/// The protocol distinguishes identically-named HTTP and HTTPS resources; it
/// is not part of the on-disk file path (objects are stored by host+path
/// only) but is part of the metadata identity (spec.md §3).
#[derive(Debug, Hash, Clone, Eq, PartialEq)]
pub struct CacheKey {
    pub protocol: Protocol,
    pub host: String,
    pub path: String,
}

impl CacheKey {
    /// Builds a key from an absolute URL. The host is lowercased and
    /// stripped of a `:443`/`:80` tail consistently with how the dispatcher
    /// matches `Host` headers.
    pub fn from_url(url: &url::Url) -> Self {
        CacheKey {
            protocol: Protocol::from_scheme(url.scheme()),
            host: url.host_str().unwrap_or_default().to_ascii_lowercase(),
            path: url.path().to_string(),
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.protocol.as_scheme(), self.host, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trips_through_index() {
        assert_eq!(Protocol::from_index(Protocol::Http.as_index()), Protocol::Http);
        assert_eq!(Protocol::from_index(Protocol::Https.as_index()), Protocol::Https);
    }

    #[test]
    fn key_from_url_lowercases_host() {
        let url = url::Url::parse("http://Repo.Example/dists/stable/InRelease").unwrap();
        let key = CacheKey::from_url(&url);
        assert_eq!(key.host, "repo.example");
        assert_eq!(key.path, "/dists/stable/InRelease");
        assert_eq!(key.protocol, Protocol::Http);
    }
}
