/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Channel table bookkeeping.
//!
//! The table owns a fixed set of slots, one per channel, plus one reserved
//! slot for the write barrier when a sync level is configured. All access is
//! serialized by the engine lock; nothing here synchronizes on its own.

use std::os::fd::RawFd;

use crate::buffer::PageBuffer;
use crate::error::EngineResult;

/// Operation carried by a [`PendingRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// Positioned read of one block into the slot's buffer.
    Read,
    /// Positioned write of up to one block from a caller buffer.
    Write,
    /// Flush barrier following a write; the engine's sync level selects
    /// between a full and a data-only flush.
    SyncBarrier,
}

/// A prepared request waiting for the next batch submission.
///
/// Plain data: the descriptor and buffer pointer are interpreted only when
/// the submission entry is built, and the record never outlives the
/// submit/wait cycle that consumes it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingRequest {
    pub kind: RequestKind,
    pub fd: RawFd,
    /// Absolute byte offset of the transfer. Unused for barriers.
    pub offset: u64,
    /// Transfer length in bytes. Unused for barriers.
    pub len: u32,
    /// Transfer buffer. Points into the buffer of the slot holding the
    /// request for reads and writes, and is null for barriers.
    pub buf: *mut u8,
}

// SAFETY: the buffer pointer refers to the holding slot's own allocation,
// which lives as long as the table and is not handed out while an entry for
// it is with the kernel. It is only dereferenced by the kernel between
// submission and completion.
unsafe impl Send for PendingRequest {}

/// One channel: occupancy, the in-flight bookkeeping, and the owned buffer.
#[derive(Debug)]
pub(crate) struct Slot {
    /// Whether the slot is allocated to an operation.
    pub occupied: bool,
    /// Prepared request, present from preparation until its completion is
    /// drained.
    pub request: Option<PendingRequest>,
    /// Whether the request's submission entry has been handed to the queue.
    pub pushed: bool,
    /// Raw completion result: bytes transferred, or a negated errno.
    pub result: Option<i32>,
    /// Set when a failed write had to abandon the slot with its entry still
    /// queued; the completion drain releases the slot when the entry is
    /// finally reaped.
    pub stranded: bool,
    /// Block-sized transfer buffer owned by this slot.
    pub buffer: PageBuffer,
}

/// Fixed-size channel table with first-free slot allocation.
///
/// Slot indices are assigned ascending from zero, so the first acquisition
/// on an idle table always yields slot 0. The reserved sync slot, when
/// present, is the last index and is only handed out when `extra` is
/// requested; it never counts toward `in_use`.
#[derive(Debug)]
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    channel_count: usize,
    in_use: usize,
}

impl SlotTable {
    /// Build a table of `channel_count` slots, plus the reserved sync slot
    /// when `reserve_sync_slot` is set, each owning one zeroed buffer of
    /// `block_size` bytes.
    pub fn new(
        channel_count: usize,
        reserve_sync_slot: bool,
        block_size: usize,
    ) -> EngineResult<Self> {
        let size = channel_count + usize::from(reserve_sync_slot);
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            slots.push(Slot {
                occupied: false,
                request: None,
                pushed: false,
                result: None,
                stranded: false,
                buffer: PageBuffer::new(block_size)?,
            });
        }

        Ok(Self {
            slots,
            channel_count,
            in_use: 0,
        })
    }

    /// Total number of slots, reserved sync slot included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied normal slots.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Whether no normal slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.slots[index]
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Whether `index` is the reserved sync slot.
    pub fn is_reserved(&self, index: usize) -> bool {
        index >= self.channel_count
    }

    /// Mark the first free slot occupied and return its index.
    ///
    /// With `extra` unset the scan covers the normal slots only and the
    /// acquisition counts toward `in_use`. With `extra` set the scan also
    /// covers the reserved sync slot and `in_use` is left untouched.
    pub fn acquire(&mut self, extra: bool) -> Option<usize> {
        let scan = if extra {
            self.slots.len()
        } else {
            self.channel_count
        };

        let index = self.slots[..scan].iter().position(|slot| !slot.occupied)?;
        self.slots[index].occupied = true;
        if !extra {
            self.in_use += 1;
        }

        Some(index)
    }

    /// Free a slot and clear its request bookkeeping. Returns the number of
    /// normal slots still in use.
    pub fn release(&mut self, index: usize, extra: bool) -> usize {
        debug_assert!(index < self.slots.len());
        debug_assert!(self.slots[index].occupied);

        let slot = &mut self.slots[index];
        slot.occupied = false;
        slot.request = None;
        slot.pushed = false;
        slot.result = None;
        slot.stranded = false;

        if !extra {
            debug_assert!(self.in_use > 0);
            self.in_use -= 1;
        }

        self.in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(channels: usize, sync: bool) -> SlotTable {
        SlotTable::new(channels, sync, 512).unwrap()
    }

    #[test]
    fn new_table_is_idle() {
        let table = table(4, false);
        assert_eq!(table.len(), 4);
        assert_eq!(table.in_use(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn sync_reservation_adds_one_slot() {
        assert_eq!(table(4, true).len(), 5);
        assert_eq!(table(1, true).len(), 2);
    }

    #[test]
    fn acquires_first_free_slot_ascending() {
        let mut table = table(3, false);
        assert_eq!(table.acquire(false), Some(0));
        assert_eq!(table.acquire(false), Some(1));
        assert_eq!(table.acquire(false), Some(2));
        assert_eq!(table.in_use(), 3);
        assert_eq!(table.acquire(false), None);
    }

    #[test]
    fn released_slot_is_reissued_first() {
        let mut table = table(3, false);
        for _ in 0..3 {
            table.acquire(false);
        }
        assert_eq!(table.release(1, false), 2);
        assert_eq!(table.acquire(false), Some(1));
        assert_eq!(table.in_use(), 3);
    }

    #[test]
    fn reserved_slot_needs_the_extra_flag() {
        let mut table = table(2, true);
        assert_eq!(table.acquire(false), Some(0));
        assert_eq!(table.acquire(false), Some(1));
        // Normal acquisitions never reach the reserved slot.
        assert_eq!(table.acquire(false), None);
        // The extra scan finds it, without touching in_use.
        assert_eq!(table.acquire(true), Some(2));
        assert_eq!(table.in_use(), 2);
        assert_eq!(table.release(2, true), 2);
        assert_eq!(table.release(0, false), 1);
        assert_eq!(table.release(1, false), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn extra_acquisition_prefers_lower_free_slots() {
        // The extra scan starts from slot 0, so with normal slots free it
        // hands one of those out rather than the reserved index.
        let mut table = table(2, true);
        assert_eq!(table.acquire(true), Some(0));
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn release_clears_request_bookkeeping() {
        let mut table = table(1, false);
        let index = table.acquire(false).unwrap();
        let slot = table.slot_mut(index);
        slot.request = Some(PendingRequest {
            kind: RequestKind::Read,
            fd: -1,
            offset: 0,
            len: 512,
            buf: std::ptr::null_mut(),
        });
        slot.pushed = true;
        slot.result = Some(512);
        slot.stranded = true;

        table.release(index, false);
        let slot = table.slot(index);
        assert!(!slot.occupied);
        assert!(slot.request.is_none());
        assert!(!slot.pushed);
        assert!(slot.result.is_none());
        assert!(!slot.stranded);
    }

    #[test]
    fn only_the_last_index_of_a_syncing_table_is_reserved() {
        let with_sync = table(2, true);
        assert!(!with_sync.is_reserved(0));
        assert!(!with_sync.is_reserved(1));
        assert!(with_sync.is_reserved(2));

        let without = table(2, false);
        assert!(!without.is_reserved(0));
        assert!(!without.is_reserved(1));
    }

    #[test]
    fn each_slot_owns_a_zeroed_block_buffer() {
        let table = table(2, true);
        for index in 0..table.len() {
            let buffer = &table.slot(index).buffer;
            assert_eq!(buffer.len(), 512);
            assert!(buffer.iter().all(|&b| b == 0));
        }
    }
}
