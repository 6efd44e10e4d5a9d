//! Request Dispatcher (spec.md §4.1): decides whether a request is
//! cacheable, passthrough, or policy-rejected, and rewrites the mirror
//! overrides/remap table before the URL ever reaches Cache-serve.

use aptcache_config::Config;

/// Prefix routed to the admin HTTP surface regardless of domain policy
/// (spec.md §6 "Admin HTTP Interface").
pub const ADMIN_PREFIX: &str = "/_goaptcacher/";

/// How a request's host was classified against the configured domain lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClass {
    /// Served from the cache (subject to Cache-serve).
    Cacheable,
    /// Forwarded opaquely, without caching.
    Passthrough,
    /// Neither list matched. Only reachable when running as an open proxy
    /// (both lists empty); otherwise the request is rejected.
    Unlisted,
}

/// Classifies `host` against `config`'s domain lists (spec.md §4.1 "domain
/// suffix matching"). An empty `domains` and `passthrough_domains` pair
/// means open-proxy mode: every host is treated as passthrough.
pub fn classify_host(host: &str, config: &Config) -> HostClass {
    let open_proxy = config.domains.is_empty() && config.passthrough_domains.is_empty();
    if open_proxy {
        return HostClass::Passthrough;
    }
    if matches_any_suffix(host, &config.domains) {
        return HostClass::Cacheable;
    }
    if matches_any_suffix(host, &config.passthrough_domains) {
        return HostClass::Passthrough;
    }
    HostClass::Unlisted
}

/// True if `host` equals one of `suffixes`, or ends with `.`+suffix. Both
/// sides are compared case-insensitively (spec.md §4.1; this is also the
/// rule the already-recorded Ubuntu-override Open Question decision in
/// DESIGN.md relies on).
pub fn matches_any_suffix(host: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|suffix| {
        host.eq_ignore_ascii_case(suffix)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", suffix.to_ascii_lowercase()))
    })
}

/// Well-known mirror hostnames the `overrides` table replaces.
const UBUNTU_HOSTS: &[&str] = &["archive.ubuntu.com", "security.ubuntu.com"];
const DEBIAN_HOST: &str = "deb.debian.org";

/// Path prefixes under [`DEBIAN_HOST`] the Debian override applies to
/// (spec.md §4.1: `deb.debian.org/debian/*`, `.../debian-security*`,
/// `.../debian-debug*`, `.../debian-ports*` — these are path prefixes on a
/// single host, not separate hostnames).
const DEBIAN_PATH_PREFIXES: &[&str] =
    &["/debian/", "/debian-security", "/debian-debug", "/debian-ports"];

/// Rewrites `host` per the `overrides` section, if `host`/`path` matches one
/// of the well-known upstream mirrors this proxy knows how to redirect.
///
/// The schema carries a single `debian_server` field covering both the
/// regular archive and the security/debug/ports paths named above; there is
/// no second config field for a distinct security mirror, so this reuses
/// `debian_server` for all of them (recorded as an Open Question decision
/// in DESIGN.md).
pub fn apply_host_override(host: &str, path: &str, config: &Config) -> Option<String> {
    let lower = host.to_ascii_lowercase();
    if UBUNTU_HOSTS.iter().any(|h| lower == *h) {
        return config.overrides.ubuntu_server.clone();
    }
    if lower == DEBIAN_HOST && DEBIAN_PATH_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return config.overrides.debian_server.clone();
    }
    None
}

/// Applies the ordered exact-path `remap` table (spec.md §4.1, §6). The
/// first matching entry wins; unmatched paths pass through unchanged.
pub fn apply_remap<'a>(path: &'a str, config: &Config) -> &'a str {
    for entry in &config.remap {
        if entry.from == path {
            return &entry.to;
        }
    }
    path
}

/// True if `path` is a well-known path this proxy answers with a bare 404
/// instead of forwarding upstream (spec.md §4.1). `/robots.txt` and `/` have
/// their own dedicated responses (see `service::handle`) and are not part
/// of this set.
pub fn is_well_known_path(path: &str) -> bool {
    matches!(path, "/favicon.ico")
}

/// Body served for `GET /robots.txt` (spec.md:70).
pub const ROBOTS_TXT_BODY: &str = "User-agent: *\nDisallow: /\n";

#[cfg(test)]
mod tests {
    use super::*;
    use aptcache_config::Overrides;

    fn config_with(domains: &[&str], passthrough: &[&str]) -> Config {
        Config {
            domains: domains.iter().map(|s| s.to_string()).collect(),
            passthrough_domains: passthrough.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        }
    }

    #[test]
    fn exact_and_suffix_both_match() {
        let suffixes = vec!["archive.ubuntu.com".to_string()];
        assert!(matches_any_suffix("archive.ubuntu.com", &suffixes));
        assert!(matches_any_suffix("mirror.archive.ubuntu.com", &suffixes));
        assert!(!matches_any_suffix("notarchive.ubuntu.com", &suffixes));
    }

    #[test]
    fn empty_lists_mean_open_proxy() {
        let config = config_with(&[], &[]);
        assert_eq!(
            classify_host("anything.example", &config),
            HostClass::Passthrough
        );
    }

    #[test]
    fn cacheable_takes_priority_over_passthrough() {
        let config = config_with(&["archive.ubuntu.com"], &["example.com"]);
        assert_eq!(
            classify_host("archive.ubuntu.com", &config),
            HostClass::Cacheable
        );
        assert_eq!(
            classify_host("example.com", &config),
            HostClass::Passthrough
        );
        assert_eq!(
            classify_host("unlisted.example", &config),
            HostClass::Unlisted
        );
    }

    #[test]
    fn debian_security_paths_reuse_debian_server() {
        let mut config = Config::default();
        config.overrides = Overrides {
            ubuntu_server: Some("mirror.example/ubuntu".to_string()),
            debian_server: Some("mirror.example/debian".to_string()),
        };
        assert_eq!(
            apply_host_override("deb.debian.org", "/debian/dists/stable/InRelease", &config)
                .as_deref(),
            Some("mirror.example/debian")
        );
        assert_eq!(
            apply_host_override("deb.debian.org", "/debian-security/dists/stable/InRelease", &config)
                .as_deref(),
            Some("mirror.example/debian")
        );
        assert_eq!(
            apply_host_override("deb.debian.org", "/unrelated/path", &config),
            None
        );
        assert_eq!(
            apply_host_override("debian-security.example", "/debian-security/foo", &config),
            None
        );
    }

    #[test]
    fn remap_uses_first_match() {
        let mut config = Config::default();
        config.remap = vec![aptcache_config::Remap {
            from: "/foo".to_string(),
            to: "/bar".to_string(),
        }];
        assert_eq!(apply_remap("/foo", &config), "/bar");
        assert_eq!(apply_remap("/baz", &config), "/baz");
    }
}
