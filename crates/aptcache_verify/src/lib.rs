#![deny(missing_docs)]

//! Repository verifier (spec.md §4.12): walks cached `InRelease`/`Release`
//! documents, resolves every `Packages[.gz|.bz2|.xz]` index they reference,
//! and checks every `.deb` named in those indices against the bytes actually
//! on disk. Read-only — never touches the cache it inspects.

pub mod packages;
pub mod release;

use sha2::{Digest, Sha512};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use packages::ExpectedChecksum;

/// Errors that abort a verification run outright. A checksum mismatch is
/// not one of these — mismatches are collected and returned, not raised.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Filesystem error walking or reading the cache root.
    #[error("io error reading {path}: {source}")]
    Io {
        /// Path being read when the error occurred.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn read(path: &Path) -> Result<Vec<u8>, VerifyError> {
    std::fs::read(path).map_err(|source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Walks `cache_root` for `dists/**/InRelease` (falling back to `Release`)
/// documents and verifies every index and `.deb` they transitively
/// reference. Returns the sorted set of absolute paths whose on-disk bytes
/// don't match the declared checksum, including a mismatching index file
/// itself. Missing `.deb` files are skipped, not reported, since the cache
/// may simply not have fetched them yet.
pub fn verify_cache(cache_root: &Path) -> Result<BTreeSet<PathBuf>, VerifyError> {
    let mut mismatches = BTreeSet::new();

    for entry in walkdir::WalkDir::new(cache_root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy();
        if name != "InRelease" && name != "Release" {
            continue;
        }
        let dists_dir = match path.parent() {
            Some(p) => p,
            None => continue,
        };
        verify_release(dists_dir, path, &mut mismatches)?;
    }

    Ok(mismatches)
}

fn verify_release(
    dists_dir: &Path,
    release_path: &Path,
    mismatches: &mut BTreeSet<PathBuf>,
) -> Result<(), VerifyError> {
    let raw = read(release_path)?;
    let contents = String::from_utf8_lossy(&raw);
    let entries = release::parse_release(&contents);

    for (rel_path, (sha512, sha256)) in &entries {
        let abs = dists_dir.join(rel_path);
        if !abs.exists() {
            continue;
        }
        if !matches_expected(&abs, sha512.as_deref(), sha256.as_deref())? {
            mismatches.insert(abs.clone());
            continue;
        }

        let lower = rel_path.to_ascii_lowercase();
        let is_packages_index = lower
            .rsplit('/')
            .next()
            .map(|base| base.starts_with("Packages"))
            .unwrap_or(false);
        if !is_packages_index {
            continue;
        }

        let raw_index = read(&abs)?;
        let decompressed = match packages::decompress_packages_index(rel_path, &raw_index) {
            Ok(bytes) => bytes,
            Err(_) => {
                mismatches.insert(abs.clone());
                continue;
            }
        };
        let text = String::from_utf8_lossy(&decompressed);
        let debs = packages::parse_packages(&text);
        for (deb_rel, checksum) in &debs {
            let deb_abs = dists_dir.join(deb_rel);
            if !deb_abs.exists() {
                continue;
            }
            if !matches_expected_checksum(&deb_abs, checksum)? {
                mismatches.insert(deb_abs);
            }
        }
    }

    Ok(())
}

fn matches_expected(
    path: &Path,
    sha512: Option<&str>,
    sha256: Option<&str>,
) -> Result<bool, VerifyError> {
    if let Some(expected) = sha512 {
        return Ok(hex_sha512(path)?.eq_ignore_ascii_case(expected));
    }
    if let Some(expected) = sha256 {
        let actual = aptcache_digest::compute_file_digest(path).map_err(|source| VerifyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        return Ok(aptcache_digest::to_hex(&actual).eq_ignore_ascii_case(expected));
    }
    Ok(true)
}

fn matches_expected_checksum(
    path: &Path,
    checksum: &ExpectedChecksum,
) -> Result<bool, VerifyError> {
    match checksum {
        ExpectedChecksum::Sha512(expected) => {
            Ok(hex_sha512(path)?.eq_ignore_ascii_case(expected))
        }
        ExpectedChecksum::Sha256(expected) => {
            let actual = aptcache_digest::compute_file_digest(path).map_err(|source| {
                VerifyError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            Ok(aptcache_digest::to_hex(&actual).eq_ignore_ascii_case(expected))
        }
    }
}

fn hex_sha512(path: &Path) -> Result<String, VerifyError> {
    let mut file = std::fs::File::open(path).map_err(|source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha512::new();
    std::io::copy(&mut file, &mut hasher).map_err(|source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn flags_tampered_deb_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let dists = dir.path().join("dists/stable");
        fs::create_dir_all(dists.join("main/binary-amd64")).unwrap();
        fs::create_dir_all(dists.join("pool/main/a/apt")).unwrap();

        let deb_path = dists.join("pool/main/a/apt/apt_1.0_amd64.deb");
        fs::write(&deb_path, b"deb contents").unwrap();
        let deb_digest = aptcache_digest::to_hex(&aptcache_digest::compute_bytes_digest(
            b"deb contents",
        ));

        let packages_text = format!(
            "Package: apt\nFilename: pool/main/a/apt/apt_1.0_amd64.deb\nSHA256: {deb_digest}\n\n\
             Package: missing\nFilename: pool/main/m/missing/missing_1.0_amd64.deb\nSHA256: 00\n"
        );
        let packages_path = dists.join("main/binary-amd64/Packages");
        fs::write(&packages_path, &packages_text).unwrap();
        let packages_digest = aptcache_digest::to_hex(&aptcache_digest::compute_bytes_digest(
            packages_text.as_bytes(),
        ));

        let release_text = format!(
            "Origin: test\nSHA256:\n {packages_digest} {len} main/binary-amd64/Packages\n",
            len = packages_text.len()
        );
        fs::write(dists.join("InRelease"), &release_text).unwrap();

        let mismatches = verify_cache(dir.path()).unwrap();
        assert!(mismatches.is_empty(), "expected no mismatches yet: {mismatches:?}");

        fs::write(&deb_path, b"tampered contents").unwrap();
        let mismatches = verify_cache(dir.path()).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches.contains(&deb_path));
    }

    #[test]
    fn flags_tampered_release_index_itself() {
        let dir = tempfile::tempdir().unwrap();
        let dists = dir.path().join("dists/stable");
        fs::create_dir_all(dists.join("main/binary-amd64")).unwrap();

        fs::write(dists.join("main/binary-amd64/Packages"), b"Package: apt\n").unwrap();
        let release_text =
            "Origin: test\nSHA256:\n badbadbad 99999 main/binary-amd64/Packages\n";
        fs::write(dists.join("InRelease"), release_text).unwrap();

        let mismatches = verify_cache(dir.path()).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches
            .iter()
            .next()
            .unwrap()
            .ends_with("main/binary-amd64/Packages"));
    }
}
