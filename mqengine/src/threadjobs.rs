//! Per-thread job control.
//!
//! Every engine thread registers itself and, unless queues are disabled, gets a
//! [`JobQueue`] other threads can post work to. The owner runs its queued jobs
//! the next time it enters the engine through [`ThreadData::enter`]. Threads
//! whose work may run anywhere register as [`Affinity::Stealable`]; while such a
//! thread is idle a scavenger may run its jobs for it, serialised by the
//! queue's get-lock. [`Affinity::Pinned`] threads (the timer threads) never
//! have their jobs run elsewhere.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use crate::conf::Engine as EngineConf;
use crate::jobqueue::{JobQueue, QueueFull};
use crate::stats::Stats;
use crate::{EngineError, Result};

pub type JobFn = Box<dyn FnOnce(&ThreadData) + Send>;

/// Wakes a thread that may be sleeping outside the engine.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Deferred work bound for one thread.
pub struct Job {
    name: &'static str,
    run: JobFn,
}

impl Job {
    #[inline]
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(&ThreadData) + Send + 'static,
    {
        Self { name, run: Box::new(f) }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    fn run(self, td: &ThreadData) {
        (self.run)(td)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({})", self.name)
    }
}

/// Why a job could not be queued. Carries the job back so the caller can pick
/// another route for it.
#[derive(thiserror::Error)]
#[error("could not schedule job {}, {reason}", .job.name)]
pub struct ScheduleError {
    pub reason: EngineError,
    pub job: Job,
}

impl fmt::Debug for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScheduleError {{ reason: {:?}, job: {:?} }}", self.reason, self.job)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Jobs must run on the owning thread
    Pinned,
    /// Jobs may be run by a scavenger while the owner is idle
    Stealable,
}

pub struct ThreadData {
    id: ThreadId,
    name: String,
    affinity: Affinity,
    jobs: Option<JobQueue<Job>>,
    waker: Option<Waker>,
    call_depth: AtomicU32,
    idle: AtomicBool,
    processed: AtomicU64,
    stats: Arc<Stats>,
}

impl fmt::Debug for ThreadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadData")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("affinity", &self.affinity)
            .field("jobs", &self.jobs)
            .field("call_depth", &self.call_depth.load(Ordering::Relaxed))
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .field("processed", &self.processed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadData {
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    #[inline]
    pub fn jobs(&self) -> Option<&JobQueue<Job>> {
        self.jobs.as_ref()
    }

    /// Jobs this thread's queue has run, by the owner or a scavenger.
    #[inline]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// Mark the thread as waiting outside the engine, which makes its queue fair
    /// game for a scavenger when it is stealable.
    #[inline]
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Relaxed);
    }

    /// Enter the engine. The outermost entry first runs everything queued for
    /// this thread.
    pub fn enter(self: &Arc<Self>) -> EngineEntry {
        debug_assert_eq!(thread::current().id(), self.id, "entering the engine for another thread");
        self.idle.store(false, Ordering::Relaxed);
        if self.call_depth.fetch_add(1, Ordering::AcqRel) == 0 {
            self.process_jobs();
        }
        EngineEntry { td: self.clone() }
    }

    /// Run every job queued for this thread. Returns whether any ran.
    pub fn process_jobs(&self) -> bool {
        let queue = match self.jobs.as_ref() {
            Some(q) => q,
            None => return false,
        };
        if !queue.has_jobs() {
            return false;
        }
        let ran = {
            let mut guard = queue.lock_get();
            let mut ran = 0;
            while let Some(job) = guard.get_job() {
                log::trace!("{} running {:?}", self.name, job);
                job.run(self);
                ran += 1;
            }
            ran
        };
        queue.set_owner_missed(false);
        self.processed.fetch_add(ran, Ordering::Relaxed);
        self.stats.jobs_processed.incs(ran as isize);
        ran > 0
    }

    fn push(&self, job: Job) -> std::result::Result<(), ScheduleError> {
        let queue = match self.jobs.as_ref() {
            Some(q) => q,
            None => {
                return Err(ScheduleError {
                    reason: EngineError::Msg("thread job queues are disabled".into()),
                    job,
                })
            }
        };
        match queue.add_job(job, true) {
            Ok(()) => {
                self.stats.jobs_scheduled.inc();
                if let Some(waker) = self.waker.as_ref() {
                    waker();
                }
                Ok(())
            }
            Err(QueueFull(job)) => {
                queue.set_owner_missed(true);
                self.stats.job_queue_full.inc();
                log::debug!("job queue of {} is full, {:?} not scheduled", self.name, job);
                Err(ScheduleError { reason: EngineError::QueueFull, job })
            }
        }
    }
}

/// Held while a thread is inside the engine.
pub struct EngineEntry {
    td: Arc<ThreadData>,
}

impl EngineEntry {
    #[inline]
    pub fn thread(&self) -> &Arc<ThreadData> {
        &self.td
    }
}

impl Drop for EngineEntry {
    fn drop(&mut self) {
        self.td.call_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct ThreadJobs {
    threads: DashMap<ThreadId, Arc<ThreadData>, ahash::RandomState>,
    capacity: usize,
    enabled: bool,
    scavenger: bool,
    stats: Arc<Stats>,
}

impl fmt::Debug for ThreadJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadJobs {{ threads: {}, capacity: {}, enabled: {} }}", self.threads.len(), self.capacity, self.enabled)
    }
}

impl ThreadJobs {
    pub fn new(cfg: &EngineConf, stats: Arc<Stats>) -> Self {
        Self {
            threads: DashMap::default(),
            capacity: cfg.thread_job_queue_capacity,
            enabled: !cfg.disable_thread_job_queues,
            scavenger: cfg.thread_job_scavenger,
            stats,
        }
    }

    /// Register the calling thread with the engine.
    pub fn register(&self, name: &str, affinity: Affinity, waker: Option<Waker>) -> Result<Arc<ThreadData>> {
        let id = thread::current().id();
        if let Some(td) = self.threads.get(&id) {
            return Ok(td.value().clone());
        }
        let jobs = if self.enabled { Some(JobQueue::new(self.capacity)?) } else { None };
        let td = Arc::new(ThreadData {
            id,
            name: name.to_owned(),
            affinity,
            jobs,
            waker,
            call_depth: AtomicU32::new(0),
            idle: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            stats: self.stats.clone(),
        });
        self.threads.insert(id, td.clone());
        log::debug!("registered engine thread {} ({:?}, {:?})", name, id, affinity);
        Ok(td)
    }

    /// Remove the calling thread, running whatever is still queued for it.
    pub fn deregister(&self) {
        let id = thread::current().id();
        if let Some((_, td)) = self.threads.remove(&id) {
            td.process_jobs();
            log::debug!("deregistered engine thread {} ({:?})", td.name, id);
        }
    }

    #[inline]
    pub fn get(&self, id: ThreadId) -> Option<Arc<ThreadData>> {
        self.threads.get(&id).map(|td| td.value().clone())
    }

    #[inline]
    pub fn current(&self) -> Option<Arc<ThreadData>> {
        self.get(thread::current().id())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Queue `job` to run on `target` the next time it enters the engine.
    pub fn schedule(&self, target: ThreadId, job: Job) -> std::result::Result<(), ScheduleError> {
        match self.get(target) {
            Some(td) => td.push(job),
            None => Err(ScheduleError { reason: EngineError::UnknownThread(format!("{target:?}")), job }),
        }
    }

    /// Run jobs queued for idle, stealable threads. Never blocks on a queue
    /// another thread is draining. Returns the number of jobs run.
    pub fn scavenge(&self) -> usize {
        if !self.scavenger {
            return 0;
        }
        let me = thread::current().id();
        let candidates = self
            .threads
            .iter()
            .filter(|td| *td.key() != me && td.affinity == Affinity::Stealable && td.is_idle())
            .map(|td| td.value().clone())
            .collect::<Vec<_>>();

        let mut total = 0;
        for td in candidates {
            let queue = match td.jobs.as_ref() {
                Some(q) if q.has_jobs() => q,
                _ => continue,
            };
            if let Some(mut guard) = queue.try_lock_get() {
                let mut ran = 0;
                while let Some(job) = guard.get_job() {
                    log::trace!("scavenging {:?} for {}", job, td.name);
                    job.run(&td);
                    ran += 1;
                }
                td.processed.fetch_add(ran, Ordering::Relaxed);
                self.stats.jobs_scavenged.incs(ran as isize);
                total += ran as usize;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;
    use crate::conf::Engine as EngineConf;

    fn thread_jobs(capacity: usize) -> Arc<ThreadJobs> {
        let cfg = EngineConf { thread_job_queue_capacity: capacity, ..Default::default() };
        Arc::new(ThreadJobs::new(&cfg, Arc::new(Stats::default())))
    }

    #[test]
    fn jobs_run_on_next_entry() {
        let tj = thread_jobs(16);
        let td = tj.register("worker", Affinity::Pinned, None).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            tj.schedule(td.id(), Job::new("count", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        {
            let _outer = td.enter();
            assert_eq!(hits.load(Ordering::SeqCst), 3);

            let h = hits.clone();
            tj.schedule(td.id(), Job::new("nested", move |_| {
                h.fetch_add(10, Ordering::SeqCst);
            }))
            .unwrap();
            // nested entries leave the queue alone
            let _inner = td.enter();
            assert_eq!(hits.load(Ordering::SeqCst), 3);
        }

        let _again = td.enter();
        assert_eq!(hits.load(Ordering::SeqCst), 13);
        assert_eq!(td.processed(), 4);
        tj.deregister();
        assert!(tj.is_empty());
    }

    #[test]
    fn jobs_run_on_the_target_thread() {
        let tj = thread_jobs(64);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let worker = {
            let tj = tj.clone();
            thread::spawn(move || {
                let td = tj.register("target", Affinity::Pinned, None).unwrap();
                ready_tx.send(td.id()).unwrap();
                loop {
                    let _entry = td.enter();
                    if let Ok(id) = done_rx.try_recv() {
                        tj.deregister();
                        return id;
                    }
                    drop(_entry);
                    thread::yield_now();
                }
            })
        };

        let target = ready_rx.recv().unwrap();
        let ran_on = Arc::new(parking_lot::Mutex::new(None));
        let r = ran_on.clone();
        tj.schedule(target, Job::new("where", move |td| {
            *r.lock() = Some((thread::current().id(), td.id()));
        }))
        .unwrap();

        while ran_on.lock().is_none() {
            thread::yield_now();
        }
        done_tx.send(()).unwrap();
        worker.join().unwrap();

        assert_eq!(*ran_on.lock(), Some((target, target)));
    }

    #[test]
    fn full_queue_hands_the_job_back() {
        let tj = thread_jobs(2);
        let td = tj.register("tiny", Affinity::Pinned, None).unwrap();
        tj.schedule(td.id(), Job::new("first", |_| {})).unwrap();
        let err = tj.schedule(td.id(), Job::new("second", |_| {})).unwrap_err();
        assert_eq!(err.reason, EngineError::QueueFull);
        assert_eq!(err.job.name(), "second");
        assert!(td.jobs().unwrap().owner_missed());

        let _entry = td.enter();
        assert!(!td.jobs().unwrap().owner_missed());
        tj.deregister();
    }

    #[test]
    fn unknown_thread_is_rejected() {
        let tj = thread_jobs(4);
        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        let err = tj.schedule(other, Job::new("lost", |_| {})).unwrap_err();
        assert!(matches!(err.reason, EngineError::UnknownThread(_)));
    }

    #[test]
    fn disabled_queues_refuse_jobs() {
        let cfg = EngineConf { disable_thread_job_queues: true, ..Default::default() };
        let tj = ThreadJobs::new(&cfg, Arc::new(Stats::default()));
        let td = tj.register("noqueue", Affinity::Stealable, None).unwrap();
        assert!(td.jobs().is_none());
        assert!(tj.schedule(td.id(), Job::new("x", |_| {})).is_err());
        assert!(!td.process_jobs());
        tj.deregister();
    }

    #[test]
    fn scavenger_only_touches_idle_stealable_threads() {
        let tj = thread_jobs(16);
        let (ids_tx, ids_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let sleeper = {
            let tj = tj.clone();
            thread::spawn(move || {
                let stealable = tj.register("stealable", Affinity::Stealable, None).unwrap();
                stealable.set_idle(true);
                ids_tx.send(stealable.id()).unwrap();
                stop_rx.recv().unwrap();
                tj.deregister();
            })
        };
        let stealable = ids_rx.recv().unwrap();
        let pinned = tj.register("pinned", Affinity::Pinned, None).unwrap();
        pinned.set_idle(true);

        let hits = Arc::new(AtomicUsize::new(0));
        for target in [stealable, pinned.id()] {
            let hits = hits.clone();
            tj.schedule(target, Job::new("steal me", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        let scavenged = thread::scope(|s| s.spawn(|| tj.scavenge()).join().unwrap());
        assert_eq!(scavenged, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tj.get(stealable).unwrap().processed(), 1);

        // the pinned queue is still waiting for its owner
        assert!(pinned.jobs().unwrap().has_jobs());
        let _entry = pinned.enter();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        drop(_entry);

        stop_tx.send(()).unwrap();
        sleeper.join().unwrap();
        tj.deregister();
    }
}
