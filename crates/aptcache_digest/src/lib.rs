#![deny(missing_docs)]

//! SHA-256 helpers shared by the cache, fetch, and verify crates.
//!
//! The cache engine identifies payloads by content hash in two places: the
//! [`AccessEntry`](../aptcache_cache/struct.AccessEntry.html) sidecar records
//! a `sha256` field, and the repository verifier recomputes the same digest
//! to compare against `Packages` index entries. Both go through the helpers
//! here so the hex representation stays consistent everywhere.

use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::Path;

/// The output of a SHA-256 hash, as raw bytes.
pub type Sha256Hash = sha2::digest::Output<Sha256>;

/// Hashes the full contents of a file on disk.
pub fn compute_file_digest(path: impl AsRef<Path>) -> io::Result<Sha256Hash> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Hashes an in-memory byte slice.
pub fn compute_bytes_digest(bytes: impl AsRef<[u8]>) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Renders a digest as a lowercase hex string, the form stored in sidecar
/// files and compared against `Packages` index entries.
pub fn to_hex(hash: &Sha256Hash) -> String {
    hex::encode(hash)
}

/// Parses a hex digest string back into raw bytes. Returns `None` if the
/// string is not exactly 32 bytes of valid hex.
pub fn parse_hex(s: &str) -> Option<Sha256Hash> {
    let mut buf = Sha256Hash::default();
    hex::decode_to_slice(s, &mut buf).ok()?;
    Some(buf)
}

/// Wraps a [`Write`] implementation, forwarding every write through to the
/// inner writer while simultaneously hashing the bytes. Used by the download
/// pipeline to compute the SHA-256 of a downloaded file without a second
/// pass over the data.
pub struct HashingWriter<W> {
    writer: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    /// Wraps `writer` with a fresh, empty hasher.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
        }
    }

    /// Consumes the wrapper, returning the inner writer and the digest of
    /// everything written through it.
    pub fn finalize(self) -> (W, Sha256Hash) {
        (self.writer, self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Hashes bytes read through a [`Read`] implementation in a single pass,
/// without buffering the whole stream in memory.
pub fn compute_reader_digest(mut reader: impl Read) -> io::Result<Sha256Hash> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn hex_round_trips() {
        let hash = compute_bytes_digest(b"abc");
        let hex = to_hex(&hash);
        assert_eq!(hex.len(), 64);
        assert_eq!(parse_hex(&hex).as_ref(), Some(&hash));
    }

    #[test]
    fn parse_hex_rejects_wrong_length() {
        assert!(parse_hex("deadbeef").is_none());
    }

    #[test]
    fn file_digest_matches_bytes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            compute_file_digest(&path).unwrap(),
            compute_bytes_digest(b"hello world")
        );
    }

    #[test]
    fn hashing_writer_tees_and_hashes() {
        let mut out = Vec::new();
        {
            let mut w = HashingWriter::new(&mut out);
            w.write_all(b"hello world").unwrap();
            let (_, hash) = w.finalize();
            assert_eq!(hash, compute_bytes_digest(b"hello world"));
        }
        assert_eq!(out, b"hello world");
    }
}
