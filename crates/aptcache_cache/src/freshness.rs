//! Freshness Engine: decides whether a cached object must be revalidated,
//! and cascades refresh to connected index files (spec.md §4.7).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Filenames (by base name, not full path) that are revalidated frequently
/// because they are repository index files.
pub const REFRESH_FILES: &[&str] = &[
    "InRelease",
    "Release",
    "Release.gpg",
    "Packages",
    "Packages.gz",
    "Packages.bz2",
    "Packages.xz",
    "Sources",
    "Sources.gz",
    "Index",
];

/// Per-file recheck timeout (spec.md §4.7):
/// - `/pool/` or `/by-hash/` paths: 7 days (content-addressed, stable).
/// - [`REFRESH_FILES`] base names: 5 minutes.
/// - everything else: 24 hours.
pub fn recheck_timeout(path: &str) -> ChronoDuration {
    if path.contains("/pool/") || path.contains("/by-hash/") {
        return ChronoDuration::days(7);
    }
    let base = path.rsplit('/').next().unwrap_or(path);
    if REFRESH_FILES.contains(&base) {
        return ChronoDuration::minutes(5);
    }
    ChronoDuration::hours(24)
}

/// True iff a recheck is due: `now - last_checked > timeout(path)`. An
/// object that has never been checked is always due.
pub fn is_recheck_due(path: &str, last_checked: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_checked {
        None => true,
        Some(last_checked) => now - last_checked > recheck_timeout(path),
    }
}

/// Sibling paths (relative to an index file's directory) that should be
/// refreshed in lockstep when that index file changes (spec.md §4.7).
pub static CONNECTED_FILES: LazyLock<HashMap<&'static str, Vec<&'static str>>> =
    LazyLock::new(|| {
        let mut map = HashMap::new();
        map.insert(
            "InRelease",
            vec![
                "Release",
                "Release.gpg",
                "main/binary-amd64/Packages",
                "main/binary-amd64/Packages.gz",
                "main/binary-amd64/Packages.xz",
                "main/binary-arm64/Packages",
                "main/binary-arm64/Packages.gz",
                "main/binary-arm64/Packages.xz",
                "main/binary-i386/Packages",
                "main/binary-i386/Packages.gz",
                "main/binary-i386/Packages.xz",
            ],
        );
        map
    });

/// Returns the sibling paths connected to `base_name`, if any.
pub fn connected_files(base_name: &str) -> &'static [&'static str] {
    CONNECTED_FILES
        .get(base_name)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_paths_get_long_timeout() {
        assert_eq!(
            recheck_timeout("/ubuntu/pool/main/a/apt/apt_2.0.deb"),
            ChronoDuration::days(7)
        );
        assert_eq!(
            recheck_timeout("/ubuntu/dists/stable/main/binary-amd64/by-hash/SHA256/abc"),
            ChronoDuration::days(7)
        );
    }

    #[test]
    fn index_files_get_short_timeout() {
        assert_eq!(
            recheck_timeout("/dists/stable/InRelease"),
            ChronoDuration::minutes(5)
        );
        assert_eq!(
            recheck_timeout("/dists/stable/main/binary-amd64/Packages.gz"),
            ChronoDuration::minutes(5)
        );
    }

    #[test]
    fn other_files_get_day_timeout() {
        assert_eq!(
            recheck_timeout("/pool-index.html"),
            ChronoDuration::hours(24)
        );
    }

    #[test]
    fn never_checked_is_always_due() {
        assert!(is_recheck_due("/dists/stable/InRelease", None, Utc::now()));
    }

    #[test]
    fn recent_check_is_not_due() {
        let now = Utc::now();
        assert!(!is_recheck_due("/dists/stable/InRelease", Some(now), now));
    }

    #[test]
    fn stale_check_is_due() {
        let now = Utc::now();
        let ten_minutes_ago = now - ChronoDuration::minutes(10);
        assert!(is_recheck_due(
            "/dists/stable/InRelease",
            Some(ten_minutes_ago),
            now
        ));
    }

    #[test]
    fn in_release_has_connected_packages_files() {
        let siblings = connected_files("InRelease");
        assert!(siblings.contains(&"Release"));
        assert!(siblings.contains(&"main/binary-amd64/Packages"));
    }

    #[test]
    fn unconnected_file_has_no_siblings() {
        assert!(connected_files("some-leaf.deb").is_empty());
    }
}
