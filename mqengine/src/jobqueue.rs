//! Per-thread job queue.
//!
//! A fixed ring of slots feeding exactly one owning thread. Each slot is
//! `EMPTY`, holds a `JOB`, or is the `SEPARATOR`. The separator always sits in
//! the slot the consumer vacated last, so a producer reaching it knows the ring
//! is full without comparing cursors; a ring of capacity `n` therefore holds at
//! most `n - 1` jobs.
//!
//! ## Publication
//! A producer stores the job into the slot first and marks the slot `JOB` last
//! (release). The consumer reads the marker (acquire) before taking the job, so
//! it never observes a marked slot whose payload is not yet written.
//!
//! ## Locks
//! - get-lock: serialises consumers; the owner may hold it to drain a batch,
//!   a scavenger only ever try-locks it
//! - put-lock: optional, serialises producers when more than one thread adds
//!
//! Cursors and locks sit on separate cache lines so the hot producer and
//! consumer paths do not false-share.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::{ffdc, EngineError, Result};

const EMPTY: u8 = 0;
const JOB: u8 = 1;
const SEPARATOR: u8 = 2;

/// Returned by [`JobQueue::add_job`] when the slot at the put cursor is occupied.
/// Hands the rejected job back to the caller.
#[derive(thiserror::Error)]
#[error("job queue full")]
pub struct QueueFull<T>(pub T);

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueFull")
    }
}

impl<T> QueueFull<T> {
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<QueueFull<T>> for EngineError {
    fn from(_: QueueFull<T>) -> Self {
        EngineError::QueueFull
    }
}

struct Slot<T> {
    state: AtomicU8,
    // Only the side that owns the slot under the separator protocol touches
    // this, so the lock is never contended.
    job: Mutex<Option<T>>,
}

impl<T> Slot<T> {
    fn new(state: u8) -> Self {
        Self { state: AtomicU8::new(state), job: Mutex::new(None) }
    }
}

/// One side of the ring: its lock and its cursor, on a cache line of its own.
#[repr(align(64))]
struct Side {
    lock: Mutex<()>,
    pos: AtomicUsize,
}

impl Side {
    const fn new() -> Self {
        Self { lock: Mutex::new(()), pos: AtomicUsize::new(0) }
    }
}

pub struct JobQueue<T> {
    get: Side,
    put: Side,
    slots: Box<[Slot<T>]>,
    owner_missed: AtomicBool,
}

impl<T> fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity())
            .field("get_pos", &self.get.pos.load(Ordering::Relaxed))
            .field("put_pos", &self.put.pos.load(Ordering::Relaxed))
            .field("owner_missed", &self.owner_missed())
            .finish()
    }
}

impl<T> JobQueue<T> {
    /// Create an empty queue with the separator preloaded in the last slot.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(EngineError::InvalidArgument(format!("job queue capacity {capacity} is below 2")));
        }
        let slots = (0..capacity)
            .map(|i| Slot::new(if i == capacity - 1 { SEPARATOR } else { EMPTY }))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            get: Side::new(),
            put: Side::new(),
            slots,
            owner_missed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn next(&self, pos: usize) -> usize {
        let next = pos + 1;
        if next == self.slots.len() {
            0
        } else {
            next
        }
    }

    #[inline]
    fn prev(&self, pos: usize) -> usize {
        if pos == 0 {
            self.slots.len() - 1
        } else {
            pos - 1
        }
    }

    /// Add a job at the put cursor. Never blocks on space: a full ring hands the
    /// job back. Pass `take_lock = false` only when this is the sole producer.
    pub fn add_job(&self, job: T, take_lock: bool) -> Result<(), QueueFull<T>> {
        let _guard = if take_lock { Some(self.put.lock.lock()) } else { None };

        let pos = self.put.pos.load(Ordering::Relaxed);
        let slot = &self.slots[pos];
        if slot.state.load(Ordering::Acquire) != EMPTY {
            return Err(QueueFull(job));
        }

        *slot.job.lock() = Some(job);
        slot.state.store(JOB, Ordering::Release);
        self.put.pos.store(self.next(pos), Ordering::Relaxed);
        Ok(())
    }

    /// Take the job at the get cursor, or `None` when the queue is empty.
    /// Pass `take_lock = false` only when already serialised with other consumers,
    /// see [`JobQueue::lock_get`] for draining in batches.
    pub fn get_job(&self, take_lock: bool) -> Option<T> {
        if take_lock {
            self.lock_get().get_job()
        } else {
            self.take_next()
        }
    }

    /// Block until the get-lock is held.
    #[inline]
    pub fn lock_get(&self) -> GetGuard<'_, T> {
        GetGuard { queue: self, _guard: self.get.lock.lock() }
    }

    /// Take the get-lock only if nobody holds it.
    #[inline]
    pub fn try_lock_get(&self) -> Option<GetGuard<'_, T>> {
        self.get.lock.try_lock().map(|guard| GetGuard { queue: self, _guard: guard })
    }

    #[inline]
    pub fn lock_put(&self) -> MutexGuard<'_, ()> {
        self.put.lock.lock()
    }

    #[inline]
    pub fn try_lock_put(&self) -> Option<MutexGuard<'_, ()>> {
        self.put.lock.try_lock()
    }

    /// Cheap racy check, used to decide whether draining is worth a lock.
    #[inline]
    pub fn has_jobs(&self) -> bool {
        let pos = self.get.pos.load(Ordering::Relaxed);
        self.slots[pos].state.load(Ordering::Acquire) == JOB
    }

    /// Set when a producer found the queue full and could not reach the owner.
    #[inline]
    pub fn owner_missed(&self) -> bool {
        self.owner_missed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_owner_missed(&self, missed: bool) {
        self.owner_missed.store(missed, Ordering::Relaxed);
    }

    fn take_next(&self) -> Option<T> {
        let pos = self.get.pos.load(Ordering::Relaxed);
        let slot = &self.slots[pos];
        if slot.state.load(Ordering::Acquire) != JOB {
            return None;
        }

        let job = match slot.job.lock().take() {
            Some(job) => job,
            None => ffdc::fatal("job queue slot marked as a job but holds none", &(pos, self)),
        };

        // Rotate the separator: the vacated slot becomes the new separator and the
        // old one is released to producers.
        slot.state.store(SEPARATOR, Ordering::Release);
        let prev = &self.slots[self.prev(pos)];
        if prev.state.swap(EMPTY, Ordering::AcqRel) != SEPARATOR {
            ffdc::fatal("job queue separator not found behind the get cursor", &(pos, self));
        }
        self.get.pos.store(self.next(pos), Ordering::Relaxed);
        Some(job)
    }
}

/// Proof that the get-lock is held; lets the holder drain several jobs in one go.
pub struct GetGuard<'a, T> {
    queue: &'a JobQueue<T>,
    _guard: MutexGuard<'a, ()>,
}

impl<T> GetGuard<'_, T> {
    #[inline]
    pub fn get_job(&mut self) -> Option<T> {
        self.queue.take_next()
    }

    /// Take every job currently queued.
    pub fn drain(&mut self) -> Vec<T> {
        let mut jobs = Vec::new();
        while let Some(job) = self.queue.take_next() {
            jobs.push(job);
        }
        jobs
    }
}
