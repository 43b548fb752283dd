/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Engine configuration.

use std::time::Duration;

use thiserror::Error;

/// Smallest supported block size in bytes. Block sizes must also be a
/// multiple of this value so that direct I/O alignment requirements hold.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Errors returned when validating an [`EngineConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Block size outside the supported range.
    #[error(
        "block size must be a multiple of {MIN_BLOCK_SIZE} in [{MIN_BLOCK_SIZE}, {max}], received {0}",
        max = u32::MAX
    )]
    BlockSize(usize),
    /// Channel count below the minimum of one.
    #[error("channel count must be at least 1, received {0}")]
    ChannelCount(usize),
    /// Sync level wire value outside the defined set.
    #[error("sync level must be 0 (none), 1 (full) or 2 (data), received {0}")]
    SyncLevel(u32),
}

/// Synchronization policy applied after each write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncLevel {
    /// No barrier follows a write.
    #[default]
    None,
    /// A full flush (data and metadata) follows each write.
    Full,
    /// A data-only flush follows each write.
    Data,
}

impl TryFrom<u32> for SyncLevel {
    type Error = ConfigError;

    /// Map the wire values 0, 1 and 2 onto the sync levels.
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncLevel::None),
            1 => Ok(SyncLevel::Full),
            2 => Ok(SyncLevel::Data),
            other => Err(ConfigError::SyncLevel(other)),
        }
    }
}

/// Validated configuration for an engine instance.
///
/// A constructed `EngineConfig` always satisfies the validation rules, so the
/// engine never re-checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size of every transfer and every slot buffer, in bytes.
    block_size: usize,

    /// Number of normal channels available for reads and writes.
    channel_count: usize,

    /// Barrier policy applied after each write.
    sync_level: SyncLevel,

    /// Upper bound on a read-batch completion wait. `None` waits
    /// indefinitely.
    wait_timeout: Option<Duration>,
}

impl EngineConfig {
    /// Create a validated configuration.
    ///
    /// `block_size` must be a multiple of 512, at least 512, and small enough
    /// to fit the 32-bit transfer length carried by a submission entry.
    /// `channel_count` must be at least 1.
    pub fn new(
        block_size: usize,
        channel_count: usize,
        sync_level: SyncLevel,
    ) -> Result<Self, ConfigError> {
        if block_size < MIN_BLOCK_SIZE
            || block_size % MIN_BLOCK_SIZE != 0
            || block_size > u32::MAX as usize
        {
            return Err(ConfigError::BlockSize(block_size));
        }

        if channel_count < 1 {
            return Err(ConfigError::ChannelCount(channel_count));
        }

        Ok(Self {
            block_size,
            channel_count,
            sync_level,
            wait_timeout: None,
        })
    }

    /// Bound each read-batch completion wait by `timeout`.
    ///
    /// By default the engine waits indefinitely for a submitted batch. With
    /// a bound set, one whole drain attempt, waits resumed after a signal
    /// included, runs against a single deadline; on expiry the drain fails
    /// with an I/O error carrying `ETIME`, the undrained slots stay queued,
    /// and calling `read_slot` again resumes the wait. Write submissions
    /// always run to completion, since their slots are handed back within
    /// the same call. Callers relying on the unbounded blocking model
    /// should leave this unset.
    ///
    /// An expired batch that is abandoned rather than drained keeps its
    /// entries with the kernel, and dropping the engine waits those out; on
    /// a descriptor that never produces data, that wait blocks teardown
    /// indefinitely. Drain expired batches before dropping the engine.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Size of every transfer and slot buffer, in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of normal channels.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Barrier policy applied after each write.
    pub fn sync_level(&self) -> SyncLevel {
        self.sync_level
    }

    /// Configured completion-wait bound, if any.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    /// Total number of slots in the channel table, including the reserved
    /// sync slot when a barrier policy is configured.
    pub(crate) fn table_size(&self) -> usize {
        match self.sync_level {
            SyncLevel::None => self.channel_count,
            SyncLevel::Full | SyncLevel::Data => self.channel_count + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_configurations() {
        for (bs, channels, sync) in [
            (512, 1, SyncLevel::None),
            (4096, 8, SyncLevel::Full),
            (8192, 64, SyncLevel::Data),
            (512 * 3, 2, SyncLevel::None),
        ] {
            let config = EngineConfig::new(bs, channels, sync).unwrap();
            assert_eq!(config.block_size(), bs);
            assert_eq!(config.channel_count(), channels);
            assert_eq!(config.sync_level(), sync);
            assert_eq!(config.wait_timeout(), None);
        }
    }

    #[test]
    fn rejects_small_block_size() {
        assert_eq!(
            EngineConfig::new(256, 1, SyncLevel::None),
            Err(ConfigError::BlockSize(256))
        );
        assert_eq!(
            EngineConfig::new(0, 1, SyncLevel::None),
            Err(ConfigError::BlockSize(0))
        );
    }

    #[test]
    fn rejects_unaligned_block_size() {
        assert_eq!(
            EngineConfig::new(4095, 1, SyncLevel::None),
            Err(ConfigError::BlockSize(4095))
        );
        assert_eq!(
            EngineConfig::new(513, 1, SyncLevel::None),
            Err(ConfigError::BlockSize(513))
        );
    }

    #[test]
    fn rejects_block_size_beyond_u32() {
        let too_big = (u32::MAX as usize) + 512;
        assert_eq!(
            EngineConfig::new(too_big, 1, SyncLevel::None),
            Err(ConfigError::BlockSize(too_big))
        );
    }

    #[test]
    fn rejects_zero_channels() {
        assert_eq!(
            EngineConfig::new(4096, 0, SyncLevel::None),
            Err(ConfigError::ChannelCount(0))
        );
    }

    #[test]
    fn sync_level_wire_values_round_trip() {
        assert_eq!(SyncLevel::try_from(0), Ok(SyncLevel::None));
        assert_eq!(SyncLevel::try_from(1), Ok(SyncLevel::Full));
        assert_eq!(SyncLevel::try_from(2), Ok(SyncLevel::Data));
        assert_eq!(SyncLevel::try_from(3), Err(ConfigError::SyncLevel(3)));
        assert_eq!(
            SyncLevel::try_from(u32::MAX),
            Err(ConfigError::SyncLevel(u32::MAX))
        );
    }

    #[test]
    fn table_reserves_a_slot_only_when_syncing() {
        let none = EngineConfig::new(4096, 4, SyncLevel::None).unwrap();
        assert_eq!(none.table_size(), 4);

        let full = EngineConfig::new(4096, 4, SyncLevel::Full).unwrap();
        assert_eq!(full.table_size(), 5);

        let data = EngineConfig::new(4096, 4, SyncLevel::Data).unwrap();
        assert_eq!(data.table_size(), 5);
    }

    #[test]
    fn wait_timeout_is_opt_in() {
        let config = EngineConfig::new(4096, 2, SyncLevel::None)
            .unwrap()
            .with_wait_timeout(Duration::from_millis(250));
        assert_eq!(config.wait_timeout(), Some(Duration::from_millis(250)));
    }
}
