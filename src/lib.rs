/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */
#![cfg_attr(
    not(test),
    warn(clippy::panic, clippy::unwrap_used, clippy::expect_used)
)]

//! Direct, page-aligned block I/O over a fixed pool of channels.
//!
//! An [`IoEngine`] moves whole blocks between page-aligned buffers and
//! files opened for cache-bypassing I/O, multiplexing the transfers through
//! a fixed number of channels backed by the kernel's io_uring interface.
//! Reads are pipelined: up to `channel_count` of them can be queued and are
//! submitted as one batch when the first result is drained. Writes are
//! serialized: a write, together with its optional flush barrier, is
//! submitted and awaited before the call returns, and at most one is ever
//! in flight.
//!
//! The engine itself is Linux-only; the buffer and configuration types are
//! portable.
//!
//! ```no_run
//! use pagedio::{DirectFile, EngineConfig, IoEngine, SyncLevel};
//! use std::os::fd::AsRawFd;
//!
//! # fn main() -> pagedio::EngineResult<()> {
//! let config = EngineConfig::new(4096, 8, SyncLevel::Data)?;
//! let engine = IoEngine::new(config)?;
//! let file = DirectFile::create("blocks.dat", 0o644)?;
//!
//! let mut block = engine.write_buffer()?;
//! block[..11].copy_from_slice(b"hello block");
//! engine.submit_write(file.as_raw_fd(), &block, block.len(), 0)?;
//!
//! let slot = engine.submit_read(file.as_raw_fd(), 0)?;
//! let (data, _count) = engine.read_slot(slot)?;
//! assert_eq!(&data[..11], b"hello block");
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;

pub use buffer::PageBuffer;
pub use config::{ConfigError, EngineConfig, SyncLevel, MIN_BLOCK_SIZE};
pub use error::{EngineError, EngineResult, ErrorKind};

cfg_if::cfg_if! {
    if #[cfg(all(not(miri), target_os = "linux"))] {
        pub(crate) mod slots;

        pub mod engine;
        pub use engine::IoEngine;

        pub mod file;
        pub use file::DirectFile;
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn root_exports_are_reachable() {
        let _ = core::any::type_name::<super::EngineConfig>();
        let _ = core::any::type_name::<super::PageBuffer>();
        let _ = core::any::type_name::<super::EngineError>();
        #[cfg(all(not(miri), target_os = "linux"))]
        {
            let _ = core::any::type_name::<super::IoEngine>();
            let _ = core::any::type_name::<super::DirectFile>();
        }
    }
}
