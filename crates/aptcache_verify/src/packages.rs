//! Decompresses a `Packages[.gz|.bz2|.xz]` index and parses its RFC822-style
//! stanzas for `Filename:` and checksum fields (spec.md §4.12 step 2).

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;
use xz2::read::XzDecoder;

/// The strongest checksum declared for one `.deb` entry in a `Packages`
/// stanza, preferring SHA-512 over SHA-256 (spec.md §4.12 step 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedChecksum {
    /// Hex SHA-512 digest.
    Sha512(String),
    /// Hex SHA-256 digest.
    Sha256(String),
}

/// Picks the decompressor for a `Packages` index by its file extension and
/// returns the decompressed bytes.
pub fn decompress_packages_index(name: &str, raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    if name.ends_with(".gz") {
        GzDecoder::new(raw).read_to_end(&mut out)?;
    } else if name.ends_with(".bz2") {
        BzDecoder::new(raw).read_to_end(&mut out)?;
    } else if name.ends_with(".xz") {
        XzDecoder::new(raw).read_to_end(&mut out)?;
    } else {
        out.extend_from_slice(raw);
    }
    Ok(out)
}

/// Parses stanzas (blank-line separated) out of a decompressed `Packages`
/// file, returning `Filename → strongest checksum` for every stanza that has
/// both a `Filename:` and at least one checksum field.
pub fn parse_packages(contents: &str) -> HashMap<String, ExpectedChecksum> {
    let mut out = HashMap::new();
    for stanza in contents.split("\n\n") {
        let mut filename = None;
        let mut sha256 = None;
        let mut sha512 = None;
        for line in stanza.lines() {
            if let Some(rest) = line.strip_prefix("Filename:") {
                filename = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("SHA256:") {
                sha256 = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("SHA512:") {
                sha512 = Some(rest.trim().to_string());
            }
        }
        let Some(filename) = filename else { continue };
        let checksum = match (sha512, sha256) {
            (Some(sha512), _) => ExpectedChecksum::Sha512(sha512),
            (None, Some(sha256)) => ExpectedChecksum::Sha256(sha256),
            (None, None) => continue,
        };
        out.insert(filename, checksum);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Package: apt\n\
Version: 2.0\n\
Filename: pool/main/a/apt/apt_2.0_amd64.deb\n\
SHA256: aaaa\n\
\n\
Package: dpkg\n\
Version: 1.0\n\
Filename: pool/main/d/dpkg/dpkg_1.0_amd64.deb\n\
SHA512: bbbb\n\
SHA256: cccc\n";

    #[test]
    fn prefers_sha512_when_both_present() {
        let parsed = parse_packages(SAMPLE);
        assert_eq!(
            parsed.get("pool/main/d/dpkg/dpkg_1.0_amd64.deb"),
            Some(&ExpectedChecksum::Sha512("bbbb".to_string()))
        );
    }

    #[test]
    fn falls_back_to_sha256() {
        let parsed = parse_packages(SAMPLE);
        assert_eq!(
            parsed.get("pool/main/a/apt/apt_2.0_amd64.deb"),
            Some(&ExpectedChecksum::Sha256("aaaa".to_string()))
        );
    }

    #[test]
    fn passthrough_for_uncompressed_name() {
        let out = decompress_packages_index("Packages", b"hello").unwrap();
        assert_eq!(out, b"hello");
    }
}
