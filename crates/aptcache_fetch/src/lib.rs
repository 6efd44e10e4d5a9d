#![deny(missing_docs)]

//! Download pipeline for aptcacher: stream a response body to the client and
//! disk at once, preallocate and hash it, then atomically rename into place
//! (spec.md §4.4 steps 3d-3f, §4.5, §4.8).

pub mod download;
pub mod platform;

pub use download::{download_tee, temp_path, DownloadError, DownloadOutcome};
pub use platform::{Platform, RealPlatform};
