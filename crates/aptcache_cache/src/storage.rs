//! Storage Layout: maps a [`CacheKey`] to a path under the cache root, with
//! defenses against path traversal (spec.md §6, §8 "Path containment").

use crate::cache_key::CacheKey;
use std::path::{Path, PathBuf};

/// Suffix appended to a payload path to get its sidecar metadata path.
pub const SIDECAR_SUFFIX: &str = ".aptcacher-meta.json";

/// Normalizes a host for use as a directory component: lowercase, strip
/// leading/trailing dots, replace path separators with `_`.
pub fn normalize_host(host: &str) -> String {
    host.trim_matches('.')
        .to_ascii_lowercase()
        .replace(['/', '\\'], "_")
}

/// Cleans a URL path into a sequence of safe path segments: percent-decodes
/// `%2e%2e`-style traversal, normalizes backslashes to forward slashes, and
/// resolves `.`/`..` components without ever escaping above the root. A
/// `..` that would pop past the root is simply dropped (the cleaned path is
/// reanchored at the cache directory, per spec.md §6).
pub fn clean_path_segments(path: &str) -> Vec<String> {
    let decoded = percent_encoding::percent_decode_str(path)
        .decode_utf8_lossy()
        .replace('\\', "/");

    let mut segments: Vec<String> = Vec::new();
    for raw in decoded.split('/') {
        match raw {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            other => segments.push(other.to_string()),
        }
    }
    segments
}

/// Computes the local filesystem path for a [`CacheKey`]'s payload, rooted
/// at `cache_root`. Guaranteed to lie under `cache_root` regardless of the
/// input path.
pub fn local_path(cache_root: &Path, key: &CacheKey) -> PathBuf {
    let mut path = cache_root.join(normalize_host(&key.host));
    for segment in clean_path_segments(&key.path) {
        path.push(segment);
    }
    path
}

/// Computes the sidecar metadata path for a payload path.
pub fn sidecar_path(payload_path: &Path) -> PathBuf {
    let mut s = payload_path.as_os_str().to_os_string();
    s.push(SIDECAR_SUFFIX);
    PathBuf::from(s)
}

/// Returns true if `candidate` is the sidecar path for some payload.
pub fn is_sidecar(candidate: &Path) -> bool {
    candidate
        .to_str()
        .is_some_and(|s| s.ends_with(SIDECAR_SUFFIX))
}

/// Strips the sidecar suffix, returning the payload path it describes.
pub fn payload_path_for_sidecar(sidecar: &Path) -> Option<PathBuf> {
    let s = sidecar.to_str()?;
    s.strip_suffix(SIDECAR_SUFFIX).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::Protocol;

    #[test]
    fn normalize_host_strips_dots_and_separators() {
        assert_eq!(normalize_host(".Repo.Example."), "repo.example");
        assert_eq!(normalize_host("a/b\\c"), "a_b_c");
    }

    #[test]
    fn clean_path_resolves_parent_segments() {
        assert_eq!(
            clean_path_segments("/dists/../dists/stable/InRelease"),
            vec!["dists", "stable", "InRelease"]
        );
    }

    #[test]
    fn clean_path_cannot_escape_root() {
        assert_eq!(
            clean_path_segments("/../../../../etc/passwd"),
            vec!["etc", "passwd"]
        );
    }

    #[test]
    fn clean_path_handles_percent_encoded_traversal() {
        assert_eq!(
            clean_path_segments("/%2e%2e/%2e%2e/etc/passwd"),
            vec!["etc", "passwd"]
        );
    }

    #[test]
    fn local_path_stays_under_root() {
        let root = Path::new("/var/cache/aptcacher");
        let key = CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: "/%2e%2e/%2e%2e/etc/passwd".to_string(),
        };
        let path = local_path(root, &key);
        assert!(path.starts_with(root));
        assert_eq!(path, root.join("repo.example/etc/passwd"));
    }

    #[test]
    fn sidecar_round_trips() {
        let payload = Path::new("/cache/repo.example/dists/stable/InRelease");
        let sidecar = sidecar_path(payload);
        assert!(is_sidecar(&sidecar));
        assert_eq!(payload_path_for_sidecar(&sidecar).as_deref(), Some(payload));
    }
}
