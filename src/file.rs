/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Cache-bypassing file registration.

use std::{
    fs::{File, OpenOptions},
    os::fd::{AsRawFd, RawFd},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::EngineResult;

/// A file opened for direct block transfers.
///
/// The file is opened read-write with `O_DIRECT`, created with `mode` if it
/// does not exist. Every transfer against it must use block-aligned offsets
/// and block-sized, page-aligned buffers; the engine's page addressing and
/// [`PageBuffer`](crate::PageBuffer) allocations satisfy that as long as the
/// block size is a multiple of the device's logical sector size. The
/// descriptor is closed when the value is dropped.
///
/// Filesystems without direct I/O support (tmpfs is the common case) refuse
/// the open with `EINVAL`.
#[derive(Debug)]
pub struct DirectFile {
    file: File,
    path: PathBuf,
}

impl DirectFile {
    /// Open `path` for direct I/O, creating it with `mode` if absent.
    pub fn create<P: AsRef<Path>>(path: P, mode: u32) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .custom_flags(libc::O_DIRECT)
            .mode(mode)
            .open(&path)?;

        debug!(path = %path.display(), fd = file.as_raw_fd(), "direct file registered");
        Ok(Self { file, path })
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for DirectFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Open a direct file under `dir`, or skip the calling test when the
    /// filesystem refuses `O_DIRECT`.
    fn try_create(dir: &Path, name: &str) -> Option<DirectFile> {
        match DirectFile::create(dir.join(name), 0o644) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("skipping: direct I/O unavailable here ({err})");
                None
            }
        }
    }

    #[test]
    fn create_registers_a_readable_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let Some(file) = try_create(dir.path(), "blocks.dat") else {
            return;
        };

        assert!(file.as_raw_fd() >= 0);
        assert_eq!(file.path(), dir.path().join("blocks.dat"));
        assert!(file.path().exists());
    }

    #[test]
    fn create_opens_an_existing_file_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing.dat");
        std::fs::write(&path, vec![7u8; 512]).unwrap();

        let Some(file) = try_create(dir.path(), "existing.dat") else {
            return;
        };
        drop(file);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 512);
    }
}
