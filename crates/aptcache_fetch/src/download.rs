//! The Download Pipeline: stream a response body to the client and to a
//! `.partial` temp file at once, then atomically rename into place
//! (spec.md §4.4 step 3d-3f, §4.5).

use crate::platform::Platform;
use aptcache_digest::Sha256Hash;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Above this many downloaded bytes, the pipeline asks the kernel to drop
/// the file's page-cache pages once the transfer completes.
pub const PAGE_CACHE_DROP_THRESHOLD: u64 = 128 * 1024 * 1024;

/// Chunk size used when dropping page-cache pages for a large download.
pub const PAGE_CACHE_DROP_CHUNK: u64 = 16 * 1024 * 1024;

/// Depth of the bounded tee queue between the network read loop and the
/// disk-writer task, so a slow disk applies backpressure to the upstream
/// read without the two being lockstep on every chunk.
const TEE_QUEUE_DEPTH: usize = 32;

/// Successful outcome of [`download_tee`].
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Final path the payload was renamed to.
    pub path: PathBuf,
    /// Total bytes written.
    pub bytes_written: u64,
    /// SHA-256 of the complete downloaded file.
    pub sha256: Sha256Hash,
}

/// Errors from [`download_tee`]. In every error case the `.partial` file has
/// already been removed.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// I/O error touching the temp file or destination.
    #[error("download I/O error at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    /// The upstream connection failed mid-stream.
    #[error("upstream connection failed mid-download: {0}")]
    Upstream(#[source] reqwest::Error),

    /// The client connection was closed before the transfer finished.
    #[error("client disconnected before the download completed")]
    ClientDisconnected,

    /// Declared `Content-Length` didn't match the bytes actually received.
    #[error("downloaded {actual} bytes, but Content-Length declared {expected}")]
    LengthMismatch {
        /// Bytes promised by the response headers.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// [`Platform::check_disk_space`] reported insufficient free space.
    #[error("not enough free disk space to download {needed} bytes to {path}")]
    DiskFull {
        /// Destination path the space check was performed against.
        path: PathBuf,
        /// Bytes the download declared it needs.
        needed: u64,
    },
}

/// Builds the temp file name `<target-file-name>.<uuid>.partial` alongside
/// `target` (spec.md §4.5).
pub fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.partial", uuid::Uuid::new_v4()));
    target.with_file_name(name)
}

/// Streams `body` to both `client_writer` and a `.partial` file next to
/// `target`, then verifies length and atomically renames into place.
///
/// On any error the temp file is removed before returning, so callers never
/// have to clean up a partial download themselves.
pub async fn download_tee<S, W, P>(
    mut body: S,
    mut client_writer: W,
    target: &Path,
    content_length: Option<u64>,
    platform: &P,
) -> Result<DownloadOutcome, DownloadError>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
    W: AsyncWrite + Unpin,
    P: Platform,
{
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::Io(parent.to_path_buf(), e))?;
    }

    if let Some(needed) = content_length.filter(|&n| n > 0) {
        let path = target.to_path_buf();
        let ok = platform
            .check_disk_space(target, needed)
            .map_err(|e| DownloadError::Io(path.clone(), e))?;
        if !ok {
            return Err(DownloadError::DiskFull { path, needed });
        }
    }

    let tmp_path = temp_path(target);
    let tmp_file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .await
        .map_err(|e| DownloadError::Io(tmp_path.clone(), e))?;

    let tmp_file = match content_length.filter(|&n| n > 0) {
        Some(len) => preallocate(tmp_file, len, platform)
            .await
            .map_err(|e| DownloadError::Io(tmp_path.clone(), e))?,
        None => tmp_file,
    };

    let (tx, rx) = mpsc::channel::<Bytes>(TEE_QUEUE_DEPTH);
    let writer_task = tokio::spawn(write_and_hash(tmp_file, rx));

    let stream_result = stream_to_client_and_queue(&mut body, &mut client_writer, &tx).await;
    drop(tx);

    let write_result = writer_task
        .await
        .map_err(|e| DownloadError::Io(tmp_path.clone(), std::io::Error::other(e)))?;
    let (tmp_file, written, sha256) =
        write_result.map_err(|e| DownloadError::Io(tmp_path.clone(), e))?;

    if let Err(e) = stream_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    if let Some(expected) = content_length.filter(|&n| n > 0) {
        if expected != written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(DownloadError::LengthMismatch {
                expected,
                actual: written,
            });
        }
    }

    if written > PAGE_CACHE_DROP_THRESHOLD {
        if let Err(e) = drop_page_cache(tmp_file, written, platform).await {
            tracing::warn!(path = %tmp_path.display(), error = %e, "failed to drop page cache after download");
        }
    } else {
        drop(tmp_file);
    }

    tokio::fs::rename(&tmp_path, target)
        .await
        .map_err(|e| DownloadError::Io(target.to_path_buf(), e))?;

    Ok(DownloadOutcome {
        path: target.to_path_buf(),
        bytes_written: written,
        sha256,
    })
}

async fn stream_to_client_and_queue<S, W>(
    body: &mut S,
    client_writer: &mut W,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), DownloadError>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(DownloadError::Upstream)?;
        client_writer
            .write_all(&chunk)
            .await
            .map_err(|_| DownloadError::ClientDisconnected)?;
        if tx.send(chunk).await.is_err() {
            // The writer task died; its own error will surface when we
            // join it, so just stop feeding it.
            break;
        }
    }
    client_writer
        .flush()
        .await
        .map_err(|_| DownloadError::ClientDisconnected)?;
    Ok(())
}

async fn write_and_hash(
    mut file: tokio::fs::File,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<(tokio::fs::File, u64, Sha256Hash), std::io::Error> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok((file, written, hasher.finalize()))
}

async fn preallocate<P: Platform>(
    file: tokio::fs::File,
    len: u64,
    platform: &P,
) -> std::io::Result<tokio::fs::File> {
    // fallocate/set_len is a single syscall; not worth a spawn_blocking
    // round trip (which would also require `platform` to be `'static`).
    let std_file = file.into_std().await;
    platform.preallocate(&std_file, len)?;
    Ok(tokio::fs::File::from_std(std_file))
}

async fn drop_page_cache<P: Platform>(
    file: tokio::fs::File,
    written: u64,
    platform: &P,
) -> std::io::Result<()> {
    let std_file = file.into_std().await;
    platform.drop_page_cache(&std_file, written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{FakePlatform, RealPlatform};
    use futures::stream;

    fn chunks(data: &'static [u8], size: usize) -> impl Stream<Item = reqwest::Result<Bytes>> {
        stream::iter(data.chunks(size).map(|c| Ok(Bytes::from(c))))
    }

    #[tokio::test]
    async fn downloads_and_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub/Packages.gz");
        let data: &'static [u8] = b"the quick brown fox jumps over the lazy dog";
        let mut client_sink = Vec::new();

        let outcome = download_tee(
            chunks(data, 7),
            &mut client_sink,
            &target,
            Some(data.len() as u64),
            &RealPlatform,
        )
        .await
        .unwrap();

        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert_eq!(client_sink, data);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
        assert_eq!(outcome.sha256, aptcache_digest::compute_bytes_digest(data));
    }

    #[tokio::test]
    async fn length_mismatch_removes_partial_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Release");
        let data: &'static [u8] = b"short body";
        let mut client_sink = Vec::new();

        let err = download_tee(
            chunks(data, 4),
            &mut client_sink,
            &target,
            Some(9999),
            &RealPlatform,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::LengthMismatch { .. }));
        assert!(!target.exists());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disk_full_is_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("apt.deb");
        let fake = FakePlatform::default();
        fake.disk_full
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mut client_sink = Vec::new();

        let err = download_tee(
            chunks(b"data", 4),
            &mut client_sink,
            &target,
            Some(4),
            &fake,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::DiskFull { .. }));
        assert!(!target.exists());
    }
}
