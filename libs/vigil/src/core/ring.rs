// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Bounded slot ring connecting the capture thread to the dispatcher.
//!
//! Single producer (the capture-side host context), single consumer (the
//! dispatcher). Fixed-size slots, monotonically increasing `u64` head/tail
//! sequences, and oldest-drop on overflow: `push` never blocks the capture
//! thread, a full ring displaces the oldest unconsumed unit instead. `pop`
//! blocks while empty and unblocks on [`FrameRing::cancel`].
//!
//! Synchronization protocol: slot bytes are written by the producer before
//! the `tail` release-store and read by the consumer after the matching
//! acquire-load. Displacement advances `head` by CAS from either side; the
//! consumer copies a slot out first and only then claims it, so a copy that
//! raced a displacement is discarded and retried rather than delivered.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

/// Result of a `push`. A displaced push still stored the new unit; the
/// reported sequence identifies the unit that was overwritten to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The ring was full; the oldest unconsumed unit (with this push
    /// sequence) was overwritten. The new unit was stored.
    Displaced { sequence: u64 },
    /// The unit exceeds the slot size. Nothing was stored or displaced.
    Oversized,
}

/// Result of a blocking `pop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// A unit of this length was copied into the caller's buffer.
    Unit(usize),
    /// The ring was cancelled; no further units will be delivered.
    Cancelled,
}

pub struct FrameRing {
    /// Flat slot storage, `slot_count * slot_size` bytes. Interior-mutable
    /// bytes: access is mediated by the head/tail protocol above, never by
    /// references that outlive a copy.
    buffer: Box<[UnsafeCell<u8>]>,
    lens: Box<[AtomicUsize]>,
    slot_count: u64,
    slot_size: usize,
    /// Sequence of the oldest unconsumed unit.
    head: AtomicU64,
    /// Sequence the next push will take.
    tail: AtomicU64,
    cancelled: AtomicBool,
    /// Cumulative displaced-unit count, read by the dispatcher for
    /// rate-limited RingDropped reporting.
    dropped: AtomicU64,
    gate: Mutex<()>,
    available: Condvar,
}

// Safety: slot bytes are only touched under the head/tail claim protocol;
// all indices and lengths are atomics.
unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    /// Create a ring of `slot_count` slots of `slot_size` bytes each.
    ///
    /// `slot_count` must be at least 2 and `slot_size` nonzero; the
    /// configuration layer validates user input before this runs.
    pub fn new(slot_count: usize, slot_size: usize) -> Self {
        assert!(slot_count >= 2, "ring requires at least 2 slots");
        assert!(slot_size > 0, "ring slots must be non-empty");
        let mut buffer = Vec::with_capacity(slot_count * slot_size);
        buffer.resize_with(slot_count * slot_size, || UnsafeCell::new(0));
        let mut lens = Vec::with_capacity(slot_count);
        lens.resize_with(slot_count, || AtomicUsize::new(0));
        Self {
            buffer: buffer.into_boxed_slice(),
            lens: lens.into_boxed_slice(),
            slot_count: slot_count as u64,
            slot_size,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            gate: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count as usize
    }

    /// Cumulative number of units displaced by overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Copy `bytes` into the next slot. Never blocks.
    ///
    /// Single-producer: must only be called from one thread at a time.
    pub fn push(&self, bytes: &[u8]) -> PushOutcome {
        if bytes.len() > self.slot_size {
            return PushOutcome::Dropped(DropReason::Oversized);
        }

        let tail = self.tail.load(Ordering::Relaxed);
        let mut displaced = None;
        loop {
            let head = self.head.load(Ordering::Acquire);
            if tail - head < self.slot_count {
                break;
            }
            // Full: retire the oldest unit. The consumer may win this race
            // by popping it first, which also makes room.
            match self
                .head
                .compare_exchange(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    displaced = Some(head);
                    break;
                }
                Err(_) => continue,
            }
        }

        let slot = (tail % self.slot_count) as usize;
        unsafe {
            let dst = self.buffer[slot * self.slot_size].get();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        self.lens[slot].store(bytes.len(), Ordering::Relaxed);
        self.tail.store(tail + 1, Ordering::Release);

        // Pair with the consumer's check-then-wait under the gate so a
        // publish between its emptiness check and its wait is not lost.
        drop(self.gate.lock());
        self.available.notify_one();

        match displaced {
            Some(sequence) => PushOutcome::Dropped(DropReason::Displaced { sequence }),
            None => PushOutcome::Accepted,
        }
    }

    /// Block until a unit is available or the ring is cancelled, copying
    /// the unit into `out` (which must hold at least `slot_size` bytes).
    pub fn pop(&self, out: &mut [u8]) -> PopOutcome {
        debug_assert!(out.len() >= self.slot_size);
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return PopOutcome::Cancelled;
            }
            match self.claim_oldest(out) {
                Some(len) => return PopOutcome::Unit(len),
                None => {
                    let mut guard = self.gate.lock();
                    // Re-check under the gate: push and cancel both take it
                    // after publishing their state.
                    if self.cancelled.load(Ordering::Acquire) {
                        return PopOutcome::Cancelled;
                    }
                    if self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire) {
                        continue;
                    }
                    self.available.wait(&mut guard);
                }
            }
        }
    }

    /// Non-blocking variant of `pop`. Returns `None` when the ring is
    /// empty or cancelled.
    pub fn try_pop(&self, out: &mut [u8]) -> Option<usize> {
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        self.claim_oldest(out)
    }

    /// Unblock all waiters and make every subsequent `pop` return
    /// [`PopOutcome::Cancelled`]. Idempotent; dominates pending data.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        drop(self.gate.lock());
        self.available.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Copy out the oldest unit and claim it, or `None` when empty.
    fn claim_oldest(&self, out: &mut [u8]) -> Option<usize> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let slot = (head % self.slot_count) as usize;
            let len = self.lens[slot].load(Ordering::Relaxed).min(self.slot_size);
            unsafe {
                let src = self.buffer[slot * self.slot_size].get() as *const u8;
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
            }
            // Claim after copying: if a displacement raced us, the copy may
            // be torn, so discard it and take the new oldest.
            if self
                .head
                .compare_exchange(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(len);
            }
        }
    }
}
