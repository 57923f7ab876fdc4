//! One-shot timers.
//!
//! Each [`TimerClass`] owns a dedicated engine thread that sleeps until the
//! earliest deadline, runs every due callback, and drains the thread's job
//! queue whenever it wakes. Callbacks of one class therefore run on one known
//! thread, which [`TimerService::thread_of`] exposes so work can be handed to
//! it through the job queue.
//!
//! Cancellation is best effort: [`TimerService::cancel`] succeeds whether or
//! not the callback has already started. Callers that must know the callback
//! is finished have to track that themselves.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::conf::Timer as TimerConf;
use crate::stats::Stats;
use crate::threadjobs::{Affinity, ThreadData, ThreadJobs, Waker};
use crate::{EngineError, Result};

pub type TimerFn = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerClass {
    High,
    Low,
}

impl TimerClass {
    #[inline]
    fn index(self) -> usize {
        match self {
            TimerClass::High => 0,
            TimerClass::Low => 1,
        }
    }

    #[inline]
    fn thread_name(self) -> &'static str {
        match self {
            TimerClass::High => "mqengine-timer-high",
            TimerClass::Low => "mqengine-timer-low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    class: TimerClass,
    seq: u64,
}

impl TimerKey {
    #[inline]
    pub fn class(&self) -> TimerClass {
        self.class
    }
}

#[derive(Default)]
struct State {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, TimerFn>,
    jobs_pending: bool,
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn wake(&self) {
        self.state.lock().jobs_pending = true;
        self.cond.notify_one();
    }
}

struct ClassThread {
    shared: Arc<Shared>,
    id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

pub struct TimerService {
    classes: [ClassThread; 2],
    next_seq: AtomicU64,
    stats: Arc<Stats>,
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerService {{ pending: {} }}", self.pending())
    }
}

impl TimerService {
    /// Start one timer thread per class, each registered with `thread_jobs`
    /// as a pinned engine thread.
    pub fn start(cfg: &TimerConf, thread_jobs: Arc<ThreadJobs>, stats: Arc<Stats>) -> Result<Self> {
        let high = Self::spawn(TimerClass::High, cfg.resolution, thread_jobs.clone(), stats.clone())?;
        let low = match Self::spawn(TimerClass::Low, cfg.resolution, thread_jobs, stats.clone()) {
            Ok(low) => low,
            Err(e) => {
                Self::stop_thread(&high);
                return Err(e);
            }
        };
        Ok(Self { classes: [high, low], next_seq: AtomicU64::new(1), stats })
    }

    fn spawn(
        class: TimerClass,
        resolution: Duration,
        thread_jobs: Arc<ThreadJobs>,
        stats: Arc<Stats>,
    ) -> Result<ClassThread> {
        let shared = Arc::new(Shared::default());
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(class.thread_name().into())
                .spawn(move || {
                    let waker = {
                        let shared = shared.clone();
                        Arc::new(move || shared.wake()) as Waker
                    };
                    match thread_jobs.register(class.thread_name(), Affinity::Pinned, Some(waker)) {
                        Ok(td) => {
                            let _deregister = scopeguard::guard(&thread_jobs, |tj| tj.deregister());
                            let _ = ready_tx.send(Ok(()));
                            run(class, &shared, &td, resolution, &stats);
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })
                .map_err(|e| EngineError::Msg(format!("failed to spawn {} thread, {}", class.thread_name(), e)))?
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(EngineError::Msg(format!("{} thread exited during start", class.thread_name())));
            }
        }
        let id = handle.thread().id();
        log::debug!("{} started, {:?}", class.thread_name(), id);
        Ok(ClassThread { shared, id, handle: Mutex::new(Some(handle)) })
    }

    /// The thread every callback of `class` runs on.
    #[inline]
    pub fn thread_of(&self, class: TimerClass) -> ThreadId {
        self.classes[class.index()].id
    }

    /// Run `callback` once on the `class` thread after `delay`. `None` when the
    /// service is stopping.
    pub fn schedule_once<F>(&self, class: TimerClass, delay: Duration, callback: F) -> Option<TimerKey>
    where
        F: FnOnce() + Send + 'static,
    {
        let ct = &self.classes[class.index()];
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut st = ct.shared.state.lock();
            if st.stopping {
                return None;
            }
            self.stats.timers.inc();
            st.deadlines.push(Reverse((Instant::now() + delay, seq)));
            st.live.insert(seq, Box::new(callback));
        }
        ct.shared.cond.notify_one();
        Some(TimerKey { class, seq })
    }

    /// Forget the timer if it has not fired yet. Succeeds either way; a
    /// callback that was already taken for running is not interrupted.
    pub fn cancel(&self, key: TimerKey) -> Result<()> {
        let ct = &self.classes[key.class.index()];
        let removed = ct.shared.state.lock().live.remove(&key.seq);
        if removed.is_some() {
            self.stats.timers.dec();
            log::trace!("timer {:?} cancelled", key);
        }
        Ok(())
    }

    /// Timers scheduled but not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.classes.iter().map(|ct| ct.shared.state.lock().live.len()).sum()
    }

    /// Stop both timer threads. Unfired timers are discarded, queued jobs are
    /// still run before each thread exits.
    pub fn shutdown(&self) {
        for ct in self.classes.iter() {
            Self::stop_thread(ct);
        }
    }

    fn stop_thread(ct: &ClassThread) {
        {
            let mut st = ct.shared.state.lock();
            st.stopping = true;
        }
        ct.shared.cond.notify_all();
        if let Some(handle) = ct.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // last owner dropped from one of our own callbacks, the loop exits by itself
                return;
            }
            if let Err(e) = handle.join() {
                log::error!("timer thread panicked, {:?}", e);
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(class: TimerClass, shared: &Shared, td: &Arc<ThreadData>, resolution: Duration, stats: &Stats) {
    loop {
        // Jobs run when the entry is taken, never between collecting a due
        // callback and running it, so a job posted after a failed cancel
        // always runs after that callback.
        let _entry = td.enter();

        let mut due = Vec::new();
        {
            let mut st = shared.state.lock();
            loop {
                if st.stopping {
                    let discarded = st.live.len();
                    st.live.clear();
                    st.deadlines.clear();
                    stats.timers.decs(discarded as isize);
                    if discarded > 0 {
                        log::debug!("{} stopping, {} timers discarded", class.thread_name(), discarded);
                    }
                    return;
                }
                let now = Instant::now();
                while let Some(Reverse((deadline, seq))) = st.deadlines.peek().copied() {
                    if deadline > now {
                        break;
                    }
                    st.deadlines.pop();
                    if let Some(callback) = st.live.remove(&seq) {
                        due.push(callback);
                    }
                }
                if !due.is_empty() || st.jobs_pending {
                    st.jobs_pending = false;
                    break;
                }
                let wait = st
                    .deadlines
                    .peek()
                    .map(|Reverse((deadline, _))| deadline.saturating_duration_since(now))
                    .unwrap_or(resolution)
                    .min(resolution);
                shared.cond.wait_for(&mut st, wait);
            }
        }

        stats.timers.decs(due.len() as isize);
        for callback in due {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::conf::Engine as EngineConf;
    use crate::threadjobs::Job;

    fn service() -> (Arc<ThreadJobs>, TimerService) {
        let stats = Arc::new(Stats::default());
        let tj = Arc::new(ThreadJobs::new(&EngineConf { thread_job_queue_capacity: 64, ..Default::default() }, stats.clone()));
        let timers = TimerService::start(&TimerConf::default(), tj.clone(), stats).unwrap();
        (tj, timers)
    }

    #[test]
    fn fires_after_delay_on_class_thread() {
        let (_tj, timers) = service();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        timers
            .schedule_once(TimerClass::Low, Duration::from_millis(30), move || {
                tx.send(thread::current().id()).unwrap();
            })
            .unwrap();
        let fired_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(fired_on, timers.thread_of(TimerClass::Low));
        assert_ne!(timers.thread_of(TimerClass::Low), timers.thread_of(TimerClass::High));
        timers.shutdown();
    }

    #[test]
    fn earlier_deadline_fires_first() {
        let (_tj, timers) = service();
        let (tx, rx) = mpsc::channel();
        for (delay, tag) in [(60, "late"), (10, "early")] {
            let tx = tx.clone();
            timers.schedule_once(TimerClass::High, Duration::from_millis(delay), move || tx.send(tag).unwrap()).unwrap();
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let (_tj, timers) = service();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let key = timers
            .schedule_once(TimerClass::Low, Duration::from_millis(50), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(timers.pending(), 1);
        timers.cancel(key).unwrap();
        // cancelling twice is fine
        timers.cancel(key).unwrap();
        assert_eq!(timers.pending(), 0);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn jobs_posted_to_timer_thread_run_promptly() {
        let (tj, timers) = service();
        let (tx, rx) = mpsc::channel();
        let target = timers.thread_of(TimerClass::Low);
        tj.schedule(target, Job::new("ping", move |td| tx.send((thread::current().id(), td.id())).unwrap()))
            .unwrap();
        let (ran_on, td_id) = rx.recv_timeout(Duration::from_millis(400)).unwrap();
        assert_eq!(ran_on, target);
        assert_eq!(td_id, target);
    }

    #[test]
    fn timer_gauge_never_goes_negative() {
        let stats = Arc::new(Stats::default());
        let tj = Arc::new(ThreadJobs::new(&EngineConf::default(), stats.clone()));
        let timers = TimerService::start(&TimerConf::default(), tj, stats.clone()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let fired = fired.clone();
            timers
                .schedule_once(TimerClass::High, Duration::ZERO, move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            assert!(stats.timers.count() >= 0);
        }
        let started = Instant::now();
        while fired.load(Ordering::SeqCst) < 500 {
            assert!(stats.timers.count() >= 0);
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(stats.timers.count(), 0);
        timers.shutdown();
    }

    #[test]
    fn no_timers_after_shutdown() {
        let (tj, timers) = service();
        timers.schedule_once(TimerClass::High, Duration::from_secs(60), || {}).unwrap();
        timers.shutdown();
        assert!(timers.schedule_once(TimerClass::High, Duration::ZERO, || {}).is_none());
        assert_eq!(timers.pending(), 0);
        assert!(tj.is_empty());
    }
}
