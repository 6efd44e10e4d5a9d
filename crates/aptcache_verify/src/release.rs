//! Parses the `SHA256:`/`SHA512:` file-listing blocks out of an
//! `InRelease`/`Release` document (spec.md §4.12 step 1).

use std::collections::HashMap;

/// One line of a `SHA256:`/`SHA512:` block: `<hex digest> <size> <path>`.
#[derive(Debug, Clone)]
pub struct ReleaseEntry {
    /// Hex digest as printed in the file.
    pub digest: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Path relative to the `dists/<distrib>/` directory.
    pub path: String,
}

/// `path → (sha512, sha256)` digests declared for that path, preferring
/// whichever blocks were present (a path may appear in one or both).
pub fn parse_release(contents: &str) -> HashMap<String, (Option<String>, Option<String>)> {
    let mut sha256_entries = Vec::new();
    let mut sha512_entries = Vec::new();
    let mut current: Option<&mut Vec<ReleaseEntry>> = None;

    for line in contents.lines() {
        if line.starts_with("SHA256:") {
            current = Some(&mut sha256_entries);
            continue;
        }
        if line.starts_with("SHA512:") {
            current = Some(&mut sha512_entries);
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            current = None;
            continue;
        }
        let Some(list) = current.as_deref_mut() else {
            continue;
        };
        let mut parts = line.split_whitespace();
        let (Some(digest), Some(size), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(size) = size.parse::<u64>() else {
            continue;
        };
        list.push(ReleaseEntry {
            digest: digest.to_string(),
            size,
            path: path.to_string(),
        });
    }

    let mut merged: HashMap<String, (Option<String>, Option<String>)> = HashMap::new();
    for entry in sha256_entries {
        merged.entry(entry.path).or_default().1 = Some(entry.digest);
    }
    for entry in sha512_entries {
        merged.entry(entry.path).or_default().0 = Some(entry.digest);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Origin: Ubuntu\n\
Suite: stable\n\
SHA256:\n\
 abc123 1234 main/binary-amd64/Packages.gz\n\
 def456 999 main/binary-amd64/Packages\n\
SHA512:\n\
 deadbeef 1234 main/binary-amd64/Packages.gz\n\
";

    #[test]
    fn prefers_both_blocks_when_present() {
        let parsed = parse_release(SAMPLE);
        let (sha512, sha256) = parsed.get("main/binary-amd64/Packages.gz").unwrap();
        assert_eq!(sha256.as_deref(), Some("abc123"));
        assert_eq!(sha512.as_deref(), Some("deadbeef"));
        let (sha512_only, _) = parsed.get("main/binary-amd64/Packages").unwrap();
        assert!(sha512_only.is_none());
    }

    #[test]
    fn ignores_non_indented_lines() {
        let parsed = parse_release(SAMPLE);
        assert!(!parsed.contains_key("Origin:"));
    }
}
