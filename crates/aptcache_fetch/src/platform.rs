//! Disk-space, preallocation, and page-cache hints behind a small trait, so
//! the download pipeline can be tested without real filesystem pressure
//! (spec.md §4.4 steps 3d-3f, §9 platform-trait design note).

use std::io;
use std::path::Path;

/// Platform-specific hooks the download pipeline calls during a transfer.
/// Implemented for real on Linux; every other target gets a portable
/// fallback that still produces a correct (if less efficient) download.
pub trait Platform: Send + Sync {
    /// Returns `true` if at least `needed_bytes` are free on the filesystem
    /// holding `path` (spec.md §4.4 step 3c "Disk space check").
    fn check_disk_space(&self, path: &Path, needed_bytes: u64) -> io::Result<bool>;

    /// Reserves `len` bytes for `file` before writing begins, so a large
    /// download doesn't fragment the destination volume.
    fn preallocate(&self, file: &std::fs::File, len: u64) -> io::Result<()>;

    /// Tells the kernel it can drop `file`'s page-cache entries for the
    /// first `written_len` bytes once a download has written more than
    /// [`crate::download::PAGE_CACHE_DROP_THRESHOLD`] bytes, so a large
    /// `.deb` doesn't evict hotter pages from the cache.
    fn drop_page_cache(&self, file: &std::fs::File, written_len: u64) -> io::Result<()>;
}

/// The platform in effect on this build target: real `fallocate` /
/// `posix_fadvise` / `statvfs` on Linux, portable fallbacks elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealPlatform;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::AsRawFd;

    impl Platform for RealPlatform {
        fn check_disk_space(&self, path: &Path, needed_bytes: u64) -> io::Result<bool> {
            let dir = existing_ancestor(path);
            let c_path = std::ffi::CString::new(dir.as_os_str().as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            let available = stat.f_bavail as u64 * stat.f_frsize as u64;
            Ok(available >= needed_bytes)
        }

        fn preallocate(&self, file: &std::fs::File, len: u64) -> io::Result<()> {
            let rc = unsafe {
                libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t)
            };
            if rc == 0 {
                return Ok(());
            }
            // ENOSYS/EOPNOTSUPP: filesystem doesn't support fallocate (e.g.
            // tmpfs on old kernels, some network filesystems). Fall back to
            // a plain length extension rather than failing the download.
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) => file.set_len(len),
                _ => Err(err),
            }
        }

        fn drop_page_cache(&self, file: &std::fs::File, written_len: u64) -> io::Result<()> {
            let mut offset = 0i64;
            while (offset as u64) < written_len {
                let chunk = (written_len - offset as u64).min(crate::download::PAGE_CACHE_DROP_CHUNK);
                let rc = unsafe {
                    libc::posix_fadvise(
                        file.as_raw_fd(),
                        offset as libc::off_t,
                        chunk as libc::off_t,
                        libc::POSIX_FADV_DONTNEED,
                    )
                };
                if rc != 0 {
                    return Err(io::Error::from_raw_os_error(rc));
                }
                offset += chunk as i64;
            }
            Ok(())
        }
    }

    fn existing_ancestor(path: &Path) -> std::path::PathBuf {
        let mut candidate = path.to_path_buf();
        loop {
            if candidate.exists() {
                return candidate;
            }
            if !candidate.pop() {
                return std::path::PathBuf::from(".");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::*;

    impl Platform for RealPlatform {
        fn check_disk_space(&self, _path: &Path, _needed_bytes: u64) -> io::Result<bool> {
            // No portable free-space syscall without an extra dependency;
            // optimistically allow and let the write itself fail on ENOSPC.
            Ok(true)
        }

        fn preallocate(&self, file: &std::fs::File, len: u64) -> io::Result<()> {
            file.set_len(len)
        }

        fn drop_page_cache(&self, _file: &std::fs::File, _written_len: u64) -> io::Result<()> {
            Ok(())
        }
    }
}

/// Test double recording calls instead of touching the filesystem, plus a
/// knob to simulate `ENOSPC` for the disk-space check.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct FakePlatform {
    /// When `true`, [`Platform::check_disk_space`] always reports false.
    pub disk_full: std::sync::atomic::AtomicBool,
    /// Number of times [`Platform::preallocate`] was called.
    pub preallocate_calls: std::sync::atomic::AtomicUsize,
    /// Number of times [`Platform::drop_page_cache`] was called.
    pub drop_page_cache_calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-util"))]
impl Platform for FakePlatform {
    fn check_disk_space(&self, _path: &Path, _needed_bytes: u64) -> io::Result<bool> {
        Ok(!self.disk_full.load(std::sync::atomic::Ordering::SeqCst))
    }

    fn preallocate(&self, file: &std::fs::File, len: u64) -> io::Result<()> {
        self.preallocate_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        file.set_len(len)
    }

    fn drop_page_cache(&self, _file: &std::fs::File, _written_len: u64) -> io::Result<()> {
        self.drop_page_cache_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_platform_preallocates_on_current_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prealloc");
        let file = std::fs::File::create(&path).unwrap();
        RealPlatform.preallocate(&file, 4096).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn fake_platform_reports_disk_full() {
        let fake = FakePlatform::default();
        fake.disk_full.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(!fake.check_disk_space(Path::new("/"), 1).unwrap());
    }
}
