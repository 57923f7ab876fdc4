//! Fake asynchronous commit completion.
//!
//! Stands in for a store whose commits complete later on another thread. A
//! commit that would finish inline instead queues its completion here and a
//! small pool of dedicated threads runs the callbacks, one entry at a time, in
//! FIFO order per thread.
//!
//! The buffer starts at the configured capacity and doubles when full. With a
//! non-zero ceiling it stops doubling there and producers wait for space. A
//! dispatcher thread never waits, since only dispatcher threads free space: a
//! callback that enqueues again grows the buffer past the ceiling instead.
//! Occupancy drives [`ComponentStatus`]: `Warning` from 80% of the original
//! capacity, back to `Ok` under 40%.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::conf::Store as StoreConf;
use crate::stats::Stats;
use crate::{EngineError, Result};

pub type Callback = Box<dyn FnOnce(Result<()>) + Send>;

/// Returned by [`FakeAsyncDispatcher::enqueue`] once the dispatcher is
/// shutting down. Hands the callback back to the caller.
#[derive(thiserror::Error)]
#[error("fake async dispatcher is shut down")]
pub struct ShutDown(pub Callback);

impl fmt::Debug for ShutDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShutDown")
    }
}

impl ShutDown {
    #[inline]
    pub fn into_inner(self) -> Callback {
        self.0
    }
}

impl From<ShutDown> for EngineError {
    fn from(_: ShutDown) -> Self {
        EngineError::ShuttingDown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentStatus {
    Ok,
    Warning,
}

struct Entry {
    rc: Result<()>,
    callback: Callback,
}

struct CallbackArray {
    entries: Vec<Option<Entry>>,
    head: usize,
    count: usize,
    original_capacity: usize,
    max_capacity: usize,
    status: ComponentStatus,
    paused: bool,
    running: bool,
    workers: Vec<ThreadId>,
}

impl CallbackArray {
    fn new(capacity: usize, max_capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            head: 0,
            count: 0,
            original_capacity: capacity,
            max_capacity,
            status: ComponentStatus::Ok,
            paused: false,
            running: true,
            workers: Vec::new(),
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, entry: Entry, past_ceiling: bool) -> std::result::Result<(), Entry> {
        if self.count == self.capacity() && !self.grow(past_ceiling) {
            return Err(entry);
        }
        let tail = (self.head + self.count) % self.capacity();
        self.entries[tail] = Some(entry);
        self.count += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Entry> {
        if self.count == 0 {
            return None;
        }
        let entry = self.entries[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        entry
    }

    /// Double the buffer and move the live entries to its front.
    fn grow(&mut self, past_ceiling: bool) -> bool {
        let old = self.capacity();
        let mut new = old * 2;
        if self.max_capacity > 0 && !past_ceiling {
            new = new.min(self.max_capacity);
        }
        if new <= old {
            return false;
        }
        let mut entries: Vec<Option<Entry>> = (0..new).map(|_| None).collect();
        for (i, slot) in entries.iter_mut().take(self.count).enumerate() {
            *slot = self.entries[(self.head + i) % old].take();
        }
        self.entries = entries;
        self.head = 0;
        log::debug!("fake async callback buffer grown from {} to {}", old, new);
        true
    }

    #[inline]
    fn above_high_watermark(&self) -> bool {
        self.count * 10 >= self.original_capacity * 8
    }

    #[inline]
    fn below_low_watermark(&self) -> bool {
        self.count * 10 < self.original_capacity * 4
    }
}

struct Shared {
    array: Mutex<CallbackArray>,
    work: Condvar,
    space: Condvar,
}

pub struct FakeAsyncDispatcher {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<Stats>,
}

impl fmt::Debug for FakeAsyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.shared.array.lock();
        f.debug_struct("FakeAsyncDispatcher")
            .field("count", &a.count)
            .field("capacity", &a.capacity())
            .field("original_capacity", &a.original_capacity)
            .field("max_capacity", &a.max_capacity)
            .field("status", &a.status)
            .field("paused", &a.paused)
            .field("running", &a.running)
            .finish()
    }
}

impl FakeAsyncDispatcher {
    #[inline]
    pub fn from_conf(cfg: &StoreConf, stats: Arc<Stats>) -> Result<Self> {
        Self::initialize(
            cfg.fake_async_callback_capacity,
            cfg.fake_async_callback_threads,
            cfg.fake_async_callback_max_capacity,
            stats,
        )
    }

    /// Allocate the buffer and start `threads` callback threads.
    /// `max_capacity` of 0 lets the buffer keep doubling.
    pub fn initialize(capacity: usize, threads: usize, max_capacity: usize, stats: Arc<Stats>) -> Result<Self> {
        if capacity == 0 || threads == 0 {
            return Err(EngineError::InvalidArgument(format!(
                "fake async dispatcher needs capacity and threads, got {capacity} and {threads}"
            )));
        }
        if max_capacity != 0 && max_capacity < capacity {
            return Err(EngineError::InvalidArgument(format!(
                "fake async max capacity {max_capacity} is below capacity {capacity}"
            )));
        }
        let shared = Arc::new(Shared {
            array: Mutex::new(CallbackArray::new(capacity, max_capacity)),
            work: Condvar::new(),
            space: Condvar::new(),
        });
        let dispatcher = Self { shared, threads: Mutex::new(Vec::with_capacity(threads)), stats };
        for n in 0..threads {
            let shared = dispatcher.shared.clone();
            let stats = dispatcher.stats.clone();
            let spawned = thread::Builder::new()
                .name(format!("mqengine-fakeasync-{n}"))
                .spawn(move || dispatch(&shared, &stats));
            match spawned {
                Ok(handle) => {
                    dispatcher.shared.array.lock().workers.push(handle.thread().id());
                    dispatcher.threads.lock().push(handle);
                }
                Err(e) => {
                    dispatcher.shutdown();
                    return Err(EngineError::Msg(format!("failed to spawn fake async thread, {e}")));
                }
            }
        }
        log::info!(
            "fake async dispatcher started, capacity: {}, threads: {}, max capacity: {}",
            capacity,
            threads,
            max_capacity
        );
        Ok(dispatcher)
    }

    /// Queue `callback` to be called with `rc` on a dispatcher thread. Hands
    /// the callback back once the dispatcher is shutting down.
    pub fn enqueue(&self, rc: Result<()>, callback: Callback) -> std::result::Result<(), ShutDown> {
        let mut array = self.shared.array.lock();
        let on_worker = array.workers.contains(&thread::current().id());
        let mut entry = Entry { rc, callback };
        loop {
            if !array.running {
                return Err(ShutDown(entry.callback));
            }
            match array.push(entry, on_worker) {
                Ok(()) => break,
                Err(back) => {
                    entry = back;
                    log::debug!("fake async callback buffer at its ceiling, waiting for space");
                    self.shared.space.wait(&mut array);
                }
            }
        }
        self.stats.fake_async_callbacks.inc();
        if array.status == ComponentStatus::Ok && array.above_high_watermark() {
            array.status = ComponentStatus::Warning;
            log::warn!(
                "fake async callback queue above high watermark, {} of {} entries",
                array.count,
                array.original_capacity
            );
        }
        drop(array);
        self.shared.work.notify_one();
        Ok(())
    }

    /// Stop dispatcher threads from taking new entries.
    pub fn pause(&self) {
        self.shared.array.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.array.lock().paused = false;
        self.shared.work.notify_all();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shared.array.lock().count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.array.lock().capacity()
    }

    #[inline]
    pub fn status(&self) -> ComponentStatus {
        self.shared.array.lock().status
    }

    /// Run every queued callback, then stop and join the dispatcher threads.
    pub fn shutdown(&self) {
        {
            let mut array = self.shared.array.lock();
            if !array.running {
                return;
            }
            array.running = false;
            array.paused = false;
        }
        self.shared.work.notify_all();
        self.shared.space.notify_all();
        let me = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == me {
                continue;
            }
            if let Err(e) = handle.join() {
                log::error!("fake async thread panicked, {:?}", e);
            }
        }
        log::info!("fake async dispatcher stopped");
    }
}

impl Drop for FakeAsyncDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(shared: &Shared, stats: &Stats) {
    loop {
        let entry = {
            let mut array = shared.array.lock();
            while array.running && (array.paused || array.count == 0) {
                shared.work.wait(&mut array);
            }
            let entry = match array.pop() {
                Some(entry) => entry,
                None => return,
            };
            stats.fake_async_callbacks.dec();
            if array.status == ComponentStatus::Warning && array.below_low_watermark() {
                array.status = ComponentStatus::Ok;
                log::info!(
                    "fake async callback queue back under low watermark, {} of {} entries",
                    array.count,
                    array.original_capacity
                );
            }
            entry
        };
        shared.space.notify_one();
        (entry.callback)(entry.rc);
    }
}
