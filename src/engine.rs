/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The direct I/O engine.
//!
//! One engine instance owns a fixed channel table and an io_uring context
//! sized to it. Reads are pipelined: callers queue up to `channel_count`
//! positioned reads, the first drain triggers a single batch submission, and
//! the ready gate blocks new batches until every queued slot has been
//! drained. Writes are serialized: one write (plus an optional flush barrier
//! on the reserved slot) is submitted and awaited while the engine lock is
//! held, so nothing else runs concurrently with a write.
//!
//! # Safety
//!
//! Submission entries carry raw pointers into slot buffers owned by the
//! table, never into caller memory: reads target the slot's buffer
//! directly, and writes stage the caller's bytes into the transfer slot's
//! buffer before the entry is built. A slot whose entry is still with the
//! kernel is never released for reuse, and teardown waits out in-flight
//! entries before the buffers are freed. Completions are routed back by
//! slot index through the entry's `user_data`, so a result can never be
//! applied to the wrong slot regardless of completion order.

use std::{
    io, mem,
    os::fd::RawFd,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use io_uring::{opcode, squeue, types, IoUring};
use tracing::{debug, error, trace, warn};

use crate::{
    buffer::PageBuffer,
    config::{EngineConfig, SyncLevel},
    error::{EngineError, EngineResult},
    slots::{PendingRequest, RequestKind, Slot, SlotTable},
};

/// Mutable engine state, guarded by the engine lock.
struct EngineState {
    /// Declared before `table`: the ring tears down first, so no completion
    /// can land in a freed slot buffer.
    ring: IoUring,
    table: SlotTable,
    /// True while a submitted read batch has undrained results.
    ready: bool,
}

/// Direct, page-aligned block I/O engine.
///
/// Construction validates nothing beyond what [`EngineConfig`] already
/// guarantees; it establishes the kernel completion context and allocates
/// one zeroed block buffer per slot. Teardown is `Drop`: outstanding kernel
/// transfers are awaited, then every owned resource is released. There is no
/// explicit destroy call.
///
/// All methods take `&self`; the engine is meant to be shared across threads
/// behind a reference. Every state transition happens under one internal
/// lock, which is what serializes a blocking write against everything else.
pub struct IoEngine {
    block_size: usize,
    channel_count: usize,
    sync_level: SyncLevel,
    wait_timeout: Option<Duration>,
    state: Mutex<EngineState>,
}

impl IoEngine {
    /// Create an engine for `config`.
    ///
    /// Fails with a context error if the kernel completion context cannot be
    /// created, or a resource error if a slot buffer cannot be allocated.
    /// Construction is ordered so that a partial failure releases everything
    /// already built.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let table_size = config.table_size();
        let entries = u32::try_from(table_size).map_err(|_| EngineError::ContextSetup {
            source: io::Error::from_raw_os_error(libc::EINVAL),
        })?;

        let ring = IoUring::new(entries).map_err(|source| EngineError::ContextSetup { source })?;
        let table = SlotTable::new(
            config.channel_count(),
            config.sync_level() != SyncLevel::None,
            config.block_size(),
        )?;

        debug!(
            block_size = config.block_size(),
            channels = config.channel_count(),
            sync_level = ?config.sync_level(),
            "engine initialized"
        );

        Ok(Self {
            block_size: config.block_size(),
            channel_count: config.channel_count(),
            sync_level: config.sync_level(),
            wait_timeout: config.wait_timeout(),
            state: Mutex::new(EngineState {
                ring,
                table,
                ready: false,
            }),
        })
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

    /// Number of normal slots currently free.
    pub fn available_slots(&self) -> EngineResult<usize> {
        let state = self.lock_state()?;
        Ok(self.channel_count - state.table.in_use())
    }

    /// Queue a positioned read of one block from `page` of `fd`.
    ///
    /// Returns the slot index holding the request. Nothing reaches the
    /// kernel yet; the batch is submitted by the first
    /// [`read_slot`](Self::read_slot) call. Fails busy while a previous
    /// batch awaits draining or when no channel is free.
    pub fn submit_read(&self, fd: RawFd, page: u64) -> EngineResult<usize> {
        let offset = self.page_offset(page)?;

        let mut state = self.lock_state()?;
        if state.ready {
            return Err(EngineError::Busy("read batch awaiting drain"));
        }

        let Some(index) = state.table.acquire(false) else {
            return Err(EngineError::Busy("no free channel"));
        };

        let len = self.block_size as u32;
        let slot = state.table.slot_mut(index);
        let buf = slot.buffer.as_mut_ptr();
        slot.request = Some(PendingRequest {
            kind: RequestKind::Read,
            fd,
            offset,
            len,
            buf,
        });

        trace!(slot = index, fd, page, "read queued");
        Ok(index)
    }

    /// Drain the completed read held by `slot`.
    ///
    /// The first drain of a batch submits every queued request and blocks
    /// until all of them complete; on submission failure the error is
    /// returned with all slot state untouched, so the call can be retried.
    /// With a configured wait bound, an expired wait likewise surfaces its
    /// timeout error and leaves the batch queued; calling again resumes
    /// the wait. A successful drain hands the caller sole ownership of the
    /// filled buffer along with the completion byte count, and swaps a
    /// freshly zeroed buffer into the slot before releasing it. If the
    /// replacement allocation fails the slot is still released and the
    /// engine keeps its old buffer.
    pub fn read_slot(&self, slot: usize) -> EngineResult<(PageBuffer, usize)> {
        let mut state = self.lock_state()?;

        let table_size = state.table.len();
        if slot >= table_size {
            return Err(EngineError::SlotOutOfRange { slot, table_size });
        }

        if !state.ready && !state.table.is_empty() {
            self.process(&mut state, true)?;
            state.ready = true;
        }

        if !state.ready || !state.table.slot(slot).occupied {
            return Err(EngineError::SlotNotOccupied { slot });
        }

        let result = match state.table.slot(slot).result {
            Some(result) => result,
            None => return Err(EngineError::SlotNotOccupied { slot }),
        };

        if result < 0 {
            if state.table.release(slot, false) == 0 {
                state.ready = false;
            }
            warn!(slot, errno = -result, "read completion failed");
            return Err(io::Error::from_raw_os_error(-result).into());
        }
        let count = result as usize;

        // The replacement is allocated before the handoff so a failure here
        // cannot leave the slot without a buffer.
        let fresh = match PageBuffer::new(self.block_size) {
            Ok(buffer) => buffer,
            Err(err) => {
                if state.table.release(slot, false) == 0 {
                    state.ready = false;
                }
                error!(slot, "replacement buffer allocation failed");
                return Err(err);
            }
        };

        let data = mem::replace(&mut state.table.slot_mut(slot).buffer, fresh);
        if state.table.release(slot, false) == 0 {
            state.ready = false;
        }

        trace!(slot, count, "read drained");
        Ok((data, count))
    }

    /// Allocate a zeroed block buffer for the caller to fill before a write.
    ///
    /// Ownership transfers to the caller; the engine never sees the buffer
    /// again unless it is passed to [`submit_write`](Self::submit_write).
    pub fn write_buffer(&self) -> EngineResult<PageBuffer> {
        PageBuffer::new(self.block_size)
    }

    /// Write the first `count` bytes of `buffer` to `page` of `fd` and block
    /// until the transfer, and the flush barrier when one is configured,
    /// complete.
    ///
    /// The caller's bytes are staged into the transfer slot's own buffer
    /// before submission, so the kernel never holds a reference into the
    /// caller's memory and `buffer` is the caller's to manage again the
    /// moment this returns, on every path. The call holds the engine lock
    /// through the completion wait, so no other engine operation observes
    /// the write in progress; the wait always runs to completion, regardless
    /// of any configured wait bound. Reads queued before this call ride
    /// along in the same batch and become drainable afterwards. Fails busy
    /// while a read batch awaits draining or when no channel is free. Slots
    /// acquired by this call are released again on failure, except for an
    /// entry stranded with the kernel by a failed batch submission, which
    /// keeps its slot until the entry's completion is reaped by a later
    /// batch wait.
    pub fn submit_write(
        &self,
        fd: RawFd,
        buffer: &PageBuffer,
        count: usize,
        page: u64,
    ) -> EngineResult<()> {
        if count > self.block_size {
            return Err(EngineError::CountExceedsBlock {
                count,
                block_size: self.block_size,
            });
        }
        // The staging copy reads `count` bytes from the buffer's base.
        if count > buffer.len() {
            return Err(EngineError::CountExceedsBlock {
                count,
                block_size: buffer.len(),
            });
        }
        let offset = self.page_offset(page)?;

        let mut state = self.lock_state()?;
        if state.ready {
            return Err(EngineError::Busy("read batch awaiting drain"));
        }

        let Some(write_slot) = state.table.acquire(false) else {
            return Err(EngineError::Busy("no free channel"));
        };

        let sync_slot = match self.sync_level {
            SyncLevel::None => None,
            SyncLevel::Full | SyncLevel::Data => match state.table.acquire(true) {
                Some(index) => Some(index),
                None => {
                    state.table.release(write_slot, false);
                    return Err(EngineError::Busy("sync slot unavailable"));
                }
            },
        };

        {
            let slot = state.table.slot_mut(write_slot);
            slot.buffer[..count].copy_from_slice(&buffer[..count]);
            // Stale bytes past `count` would surface in a later short read
            // served from this slot.
            slot.buffer[count..].fill(0);
            let buf = slot.buffer.as_mut_ptr();
            slot.request = Some(PendingRequest {
                kind: RequestKind::Write,
                fd,
                offset,
                len: count as u32,
                buf,
            });
        }
        if let Some(index) = sync_slot {
            state.table.slot_mut(index).request = Some(PendingRequest {
                kind: RequestKind::SyncBarrier,
                fd,
                offset: 0,
                len: 0,
                buf: std::ptr::null_mut(),
            });
        }

        trace!(slot = write_slot, sync_slot, fd, page, count, "write submitted");

        if let Err(err) = self.process(&mut state, false) {
            if let Some(index) = sync_slot {
                release_settled(&mut state.table, index, true);
            }
            release_settled(&mut state.table, write_slot, false);
            error!(slot = write_slot, error = %err, "write batch failed");
            return Err(err);
        }

        let write_result = state.table.slot(write_slot).result.unwrap_or(-libc::EIO);
        let sync_result = match sync_slot {
            Some(index) => state.table.slot(index).result.unwrap_or(-libc::EIO),
            None => 0,
        };

        if let Some(index) = sync_slot {
            state.table.release(index, true);
        }
        // Reads that rode along in this batch are now drainable.
        if state.table.release(write_slot, false) != 0 {
            state.ready = true;
        }

        if write_result < 0 {
            warn!(slot = write_slot, errno = -write_result, "write completion failed");
            return Err(io::Error::from_raw_os_error(-write_result).into());
        }
        if sync_result < 0 {
            warn!(errno = -sync_result, "flush barrier failed");
            return Err(io::Error::from_raw_os_error(-sync_result).into());
        }

        debug!(fd, page, written = write_result, "write completed");
        Ok(())
    }

    /// Byte offset of `page`, checked against overflow.
    fn page_offset(&self, page: u64) -> EngineResult<u64> {
        (self.block_size as u64)
            .checked_mul(page)
            .ok_or(EngineError::PageOffsetOverflow {
                page,
                block_size: self.block_size,
            })
    }

    fn lock_state(&self) -> EngineResult<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::LockPoisoned("engine state"))
    }

    /// Submit every prepared request as one batch and block until all of
    /// them complete.
    ///
    /// Requests already handed to the queue by an earlier failed call are
    /// not pushed twice; the wait covers everything still outstanding, so
    /// the call can be retried after an error without losing requests.
    ///
    /// The enter call reports how many entries it submitted in preference
    /// to how the wait it carried ended, so a returned `Ok` is no proof the
    /// batch is drained; the loop keeps waiting until no pushed entry lacks
    /// a result. Interrupted and cut-short waits resume with the remaining
    /// time against one per-call deadline. With `bounded` set and a wait
    /// bound configured, an expired wait surfaces as an I/O error carrying
    /// `ETIME` after any completions that did arrive have been applied to
    /// their slots; the unresolved slots stay queued and the next call
    /// resumes waiting for them.
    fn process(&self, state: &mut EngineState, bounded: bool) -> EngineResult<()> {
        let EngineState { ring, table, .. } = state;

        for index in 0..table.len() {
            let slot = table.slot_mut(index);
            if !slot.occupied || slot.pushed {
                continue;
            }
            let Some(request) = slot.request else {
                continue;
            };

            let entry = build_entry(index, &request, self.sync_level);
            // SAFETY: the entry points into this slot's buffer, which the
            // table keeps alive until the completion is drained; see the
            // module-level safety notes.
            if unsafe { ring.submission().push(&entry) }.is_err() {
                warn!(slot = index, "submission queue full");
                return Err(EngineError::SubmissionQueueFull { slot: index });
            }
            slot.pushed = true;
            trace!(slot = index, kind = ?request.kind, "entry pushed");
        }

        let deadline = if bounded {
            self.wait_timeout
                .and_then(|bound| Instant::now().checked_add(bound))
        } else {
            None
        };

        loop {
            let want = outstanding(table);
            if want == 0 {
                return Ok(());
            }

            let waited = match deadline {
                None => ring.submit_and_wait(want),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let timespec = types::Timespec::new()
                        .sec(remaining.as_secs())
                        .nsec(remaining.subsec_nanos());
                    let args = types::SubmitArgs::new().timespec(&timespec);
                    ring.submitter().submit_with_args(want, &args)
                }
            };

            match waited {
                Ok(_) => {
                    let drained = drain_completions(ring, table);
                    trace!(want, drained, "batch wait returned");
                }
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) if err.raw_os_error() == Some(libc::ETIME) => {
                    let drained = drain_completions(ring, table);
                    warn!(
                        drained,
                        outstanding = outstanding(table),
                        "batch wait expired"
                    );
                    return Err(err.into());
                }
                Err(err) => {
                    error!(error = %err, "batch submission failed");
                    return Err(err.into());
                }
            }
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let EngineState { ring, table, .. } = state;

        // Outstanding kernel transfers must complete before the slot
        // buffers are freed underneath them. This wait has no bound; see
        // `EngineConfig::with_wait_timeout` on abandoned expired batches.
        let inflight = outstanding(table);
        if inflight > 0 {
            warn!(inflight, "teardown waiting for in-flight transfers");
        }
        loop {
            let inflight = outstanding(table);
            if inflight == 0 {
                break;
            }
            match ring.submit_and_wait(inflight) {
                Ok(_) => {
                    drain_completions(ring, table);
                }
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => {
                    warn!(error = %err, inflight, "shutdown drain failed");
                    break;
                }
            }
        }

        debug!("engine destroyed");
    }
}

/// Build the submission entry for a prepared request, tagged with its slot
/// index for completion routing.
fn build_entry(index: usize, request: &PendingRequest, sync_level: SyncLevel) -> squeue::Entry {
    let fd = types::Fd(request.fd);
    let entry = match request.kind {
        RequestKind::Read => opcode::Read::new(fd, request.buf, request.len)
            .offset(request.offset)
            .build(),
        RequestKind::Write => opcode::Write::new(fd, request.buf as *const u8, request.len)
            .offset(request.offset)
            .build(),
        RequestKind::SyncBarrier => {
            let fsync = opcode::Fsync::new(fd);
            let fsync = match sync_level {
                SyncLevel::Data => fsync.flags(types::FsyncFlags::DATASYNC),
                SyncLevel::None | SyncLevel::Full => fsync,
            };
            fsync.build()
        }
    };

    entry.user_data(index as u64)
}

/// Release a slot acquired for a failed write, unless its entry is still
/// with the kernel. A stranded slot stays occupied so that a late completion
/// cannot be routed to a reassigned slot; the completion drain that
/// eventually reaps the entry releases the slot.
fn release_settled(table: &mut SlotTable, index: usize, extra: bool) {
    let slot = table.slot_mut(index);
    if slot.pushed && slot.result.is_none() {
        slot.stranded = true;
        warn!(slot = index, "write slot stranded in flight");
        return;
    }
    table.release(index, extra);
}

/// Number of pushed requests whose completion has not been drained yet.
fn outstanding(table: &SlotTable) -> usize {
    table
        .slots()
        .iter()
        .filter(|slot| slot.pushed && slot.result.is_none())
        .count()
}

/// Apply every available completion to its slot, releasing slots stranded
/// by a failed write on the way. Returns the number drained.
fn drain_completions(ring: &mut IoUring, table: &mut SlotTable) -> usize {
    let mut drained = 0;
    for cqe in ring.completion() {
        let index = cqe.user_data() as usize;
        debug_assert!(index < table.len(), "completion for unknown slot {index}");
        if index >= table.len() {
            continue;
        }

        let slot: &mut Slot = table.slot_mut(index);
        debug_assert!(slot.pushed, "completion for slot {index} with no entry");
        slot.result = Some(cqe.result());
        slot.request = None;
        slot.pushed = false;
        let reap = slot.stranded;
        drained += 1;

        if reap {
            let extra = table.is_reserved(index);
            table.release(index, extra);
            debug!(slot = index, "stranded slot reclaimed");
        }
    }
    drained
}
