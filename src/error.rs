/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Error types shared across the engine.

use std::{alloc::LayoutError, io};

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for a `Result<T, EngineError>`.
pub type EngineResult<T> = Result<T, EngineError>;

/// Broad classification of an [`EngineError`].
///
/// Callers that branch on the failure class rather than the concrete variant
/// (retry on `Busy`, abandon the engine on `Context`, surface `Io` to the
/// operator) should match on this instead of the error itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A configuration or argument value was rejected before any work began.
    Validation,
    /// A buffer allocation failed.
    Resource,
    /// The kernel completion context could not be set up.
    Context,
    /// The engine cannot accept the operation in its current state.
    Busy,
    /// The kernel submit/wait step failed, or a completion reported an error.
    Io,
    /// The engine lock was poisoned by a panicking holder.
    LockPoisoned,
}

/// Errors returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine configuration was rejected.
    #[error("invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    /// A page-aligned buffer could not be allocated.
    #[error("failed to allocate page buffer of {size} bytes (alignment {align})")]
    Allocation {
        /// Requested buffer size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },

    /// The buffer size and alignment do not form a valid allocation layout.
    #[error("invalid buffer layout: {source}")]
    Layout {
        #[from]
        source: LayoutError,
    },

    /// The kernel completion context could not be created.
    #[error("completion context setup failed: {source}")]
    ContextSetup {
        #[source]
        source: io::Error,
    },

    /// The operation cannot run until other work drains.
    #[error("engine busy: {0}")]
    Busy(&'static str),

    /// The kernel submit/wait step failed, or a completion carried an error.
    #[error("I/O failure: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The submission queue rejected an entry. The queue is sized to the
    /// channel table, so this indicates entries stranded by an earlier
    /// submission failure.
    #[error("submission queue rejected entry for slot {slot}")]
    SubmissionQueueFull {
        /// Slot whose entry could not be queued.
        slot: usize,
    },

    /// A slot index fell outside the channel table.
    #[error("slot {slot} is outside the channel table (size {table_size})")]
    SlotOutOfRange {
        /// Requested slot index.
        slot: usize,
        /// Total number of slots in the table.
        table_size: usize,
    },

    /// The slot holds no completed request to drain.
    #[error("slot {slot} holds no completed request")]
    SlotNotOccupied {
        /// Requested slot index.
        slot: usize,
    },

    /// A write length exceeded the block size, or the buffer it would be
    /// read from.
    #[error("write count {count} exceeds block size {block_size}")]
    CountExceedsBlock {
        /// Requested write length in bytes.
        count: usize,
        /// The limit that was exceeded, in bytes.
        block_size: usize,
    },

    /// A page index multiplied by the block size overflowed the byte-offset
    /// range.
    #[error("page {page} overflows the byte-offset range at block size {block_size}")]
    PageOffsetOverflow {
        /// Requested page index.
        page: u64,
        /// Configured block size in bytes.
        block_size: usize,
    },

    /// The engine lock was poisoned by a panicking holder. The engine state
    /// can no longer be trusted.
    #[error("engine lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl EngineError {
    /// Return the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config { .. }
            | EngineError::SlotOutOfRange { .. }
            | EngineError::CountExceedsBlock { .. }
            | EngineError::PageOffsetOverflow { .. } => ErrorKind::Validation,
            EngineError::Allocation { .. } | EngineError::Layout { .. } => ErrorKind::Resource,
            EngineError::ContextSetup { .. } => ErrorKind::Context,
            EngineError::Busy(_) => ErrorKind::Busy,
            EngineError::Io { .. }
            | EngineError::SubmissionQueueFull { .. }
            | EngineError::SlotNotOccupied { .. } => ErrorKind::Io,
            EngineError::LockPoisoned(_) => ErrorKind::LockPoisoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_is_send_and_sync() {
        fn assert_send_and_sync<T: Send + Sync>() {}
        assert_send_and_sync::<EngineError>();
    }

    #[test]
    fn io_error_converts_with_io_kind() {
        let err = EngineError::from(io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("I/O failure"));
    }

    #[test]
    fn config_error_converts_with_validation_kind() {
        let err = EngineError::from(ConfigError::ChannelCount(0));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn layout_error_converts_with_resource_kind() {
        let layout_err = std::alloc::Layout::from_size_align(1, 3).unwrap_err();
        let err = EngineError::from(layout_err);
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn kinds_map_to_their_variants() {
        assert_eq!(
            EngineError::Allocation { size: 4096, align: 4096 }.kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            EngineError::ContextSetup {
                source: io::Error::from_raw_os_error(libc::ENOSYS)
            }
            .kind(),
            ErrorKind::Context
        );
        assert_eq!(EngineError::Busy("no free channel").kind(), ErrorKind::Busy);
        assert_eq!(
            EngineError::SlotOutOfRange { slot: 9, table_size: 4 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::SlotNotOccupied { slot: 2 }.kind(),
            ErrorKind::Io
        );
        assert_eq!(
            EngineError::SubmissionQueueFull { slot: 1 }.kind(),
            ErrorKind::Io
        );
        assert_eq!(
            EngineError::CountExceedsBlock { count: 8192, block_size: 4096 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::PageOffsetOverflow { page: u64::MAX, block_size: 4096 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::LockPoisoned("engine state").kind(),
            ErrorKind::LockPoisoned
        );
    }

    #[test]
    fn display_carries_the_offending_values() {
        let err = EngineError::SlotOutOfRange { slot: 7, table_size: 3 };
        let message = err.to_string();
        assert!(message.contains('7'));
        assert!(message.contains('3'));

        let err = EngineError::CountExceedsBlock { count: 9000, block_size: 4096 };
        let message = err.to_string();
        assert!(message.contains("9000"));
        assert!(message.contains("4096"));
    }
}
