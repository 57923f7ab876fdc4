//! Timed receive.
//!
//! [`get_message_with_timeout`] creates a private consumer on the caller's
//! session and binds it to a one-shot timer. Three events race to end the
//! request, possibly on three different threads:
//!
//! * a message arrives and is handed to the message callback,
//! * the timer fires on the [`TimerClass::Low`] thread,
//! * the owning session or client is destroyed, taking the consumer with it.
//!
//! Whichever wins starts destroying the consumer. The request finishes once
//! both construction and consumer destruction have finished; that transition
//! fires the completion callback exactly once and releases the session.
//!
//! Cancelling a timer does not prove its body has stopped running, so the
//! request is never dropped from the thread that finishes it. The last step
//! is posted as a job to the timer thread, where it runs strictly after any
//! timer body for the request.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::context::EngineContext;
use crate::ffdc;
use crate::session::{Consumer, Created, CreatedFn, DeliveryFn, Destination, DestroyedFn, Message, Session};
use crate::threadjobs::Job;
use crate::timer::{TimerClass, TimerKey};
use crate::{CallStatus, EngineError, Result};

/// Receives the single message of a timed receive.
pub type MessageFn = Box<dyn FnOnce(Message) + Send>;
/// Receives the outcome of a timed receive that finished out of line.
pub type CompletionFn = Box<dyn FnOnce(Result<()>) + Send>;

const CLASS: TimerClass = TimerClass::Low;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// How the request's timer was stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CancelState: u8 {
        const BY_FUNC = 0b0000_0001;
        const CANCEL_FAILED = 0b0000_0010;
        const NO_KEY = 0b0000_0100;
        const ALREADY_FINISHED = 0b0000_1000;
        const WHEN_FIRED = 0b0001_0000;
        const MSG_ARRIVED_NO_TIMER = 0b0010_0000;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FiredState: u8 {
        const FIRED = 0b0000_0001;
        const NO_KEY = 0b0000_0010;
        const TOO_LATE = 0b0000_0100;
    }

    /// Why, and how, the private consumer was destroyed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConsumerFlags: u8 {
        const DESTROY_TIMER_FIRED = 0b0000_0001;
        const DESTROYED_ASYNC = 0b0000_0010;
        const DESTROY_ON_COMPLETE = 0b0000_0100;
        const DESTROY_NO_TIMER = 0b0000_1000;
        const DESTROY_CREATE_FAILED = 0b0001_0000;
        const DESTROY_MSG_ARRIVED = 0b0010_0000;
    }

    /// Changes made to the engine's `timer_events_requested` count.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventCount: u8 {
        const INCREASED_CREATION = 0b0000_0001;
        const DEC_CANCELLED = 0b0000_0010;
        const DEC_FIRED = 0b0000_0100;
        const FREE_STARTED = 0b0000_1000;
        const FREE_FIRED = 0b0001_0000;
    }
}

#[derive(Default)]
struct Inner {
    consumer: Option<Arc<Consumer>>,
    timer_key: Option<TimerKey>,

    // finish requires both
    construction_finished: bool,
    consumer_destroy_finished: bool,

    message_delivered: bool,
    timer_created: bool,
    timer_finished: bool,
    consumer_destroy_started: bool,
    recursively_destroyed: bool,
    completion_fired: bool,
    done: bool,

    error: Option<EngineError>,
    timer_fired_thread: Option<ThreadId>,
    on_complete: Option<CompletionFn>,

    cancel_state: CancelState,
    fired_state: FiredState,
    consumer_flags: ConsumerFlags,
    event_count: EventCount,
}

impl Inner {
    fn outcome(&self) -> Result<()> {
        if self.message_delivered {
            Ok(())
        } else if let Some(e) = self.error.as_ref() {
            Err(e.clone())
        } else if self.recursively_destroyed {
            Err(EngineError::Destroyed)
        } else {
            Err(EngineError::NoMessageAvailable)
        }
    }

    /// Take the completion callback unless it already fired.
    fn take_completion(&mut self) -> Option<CompletionFn> {
        if self.completion_fired {
            return None;
        }
        self.completion_fired = true;
        self.on_complete.take()
    }
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("consumer", &self.consumer.as_ref().map(|c| c.id()))
            .field("timer_key", &self.timer_key)
            .field("construction_finished", &self.construction_finished)
            .field("consumer_destroy_finished", &self.consumer_destroy_finished)
            .field("message_delivered", &self.message_delivered)
            .field("timer_created", &self.timer_created)
            .field("timer_finished", &self.timer_finished)
            .field("consumer_destroy_started", &self.consumer_destroy_started)
            .field("recursively_destroyed", &self.recursively_destroyed)
            .field("completion_fired", &self.completion_fired)
            .field("done", &self.done)
            .field("error", &self.error)
            .field("timer_fired_thread", &self.timer_fired_thread)
            .field("cancel_state", &self.cancel_state)
            .field("fired_state", &self.fired_state)
            .field("consumer_flags", &self.consumer_flags)
            .field("event_count", &self.event_count)
            .finish()
    }
}

/// Where a step that may finish the request left it.
enum Step<'a> {
    /// Still waiting on another event; the lock is still held
    Pending(MutexGuard<'a, Inner>),
    /// Finished with this outcome
    Finished(Result<()>),
}

/// One in-flight timed receive.
pub struct ExpiringGet {
    id: u64,
    scx: EngineContext,
    session: Arc<Session>,
    timeout: Duration,
    on_message: Mutex<Option<MessageFn>>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for ExpiringGet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ExpiringGet");
        d.field("id", &self.id).field("session", &self.session.id()).field("timeout", &self.timeout);
        match self.inner.try_lock() {
            Some(inner) => d.field("inner", &*inner),
            None => d.field("inner", &"<locked>"),
        };
        d.finish()
    }
}

/// Receive at most one message from `destination`, waiting up to `timeout`.
/// A zero timeout checks once without waiting.
///
/// Returns `Completed` when the outcome was decided before returning (the
/// message, if any, has already gone to `on_message`; `on_complete` never
/// fires), `AsyncCompletion` when `on_complete` will report it later, or the
/// error that ended the request inline: `NoMessageAvailable`, `Destroyed`,
/// `TimerUnavailable` or a consumer creation failure.
pub fn get_message_with_timeout(
    scx: &EngineContext,
    session: &Arc<Session>,
    destination: &Arc<Destination>,
    timeout: Duration,
    on_message: MessageFn,
    on_complete: CompletionFn,
) -> Result<CallStatus> {
    let _entry = scx.thread_jobs.current().map(|td| td.enter());

    session.acquire()?;
    let eg = Arc::new(ExpiringGet {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        scx: scx.clone(),
        session: session.clone(),
        timeout,
        on_message: Mutex::new(Some(on_message)),
        inner: Mutex::new(Inner { on_complete: Some(on_complete), ..Default::default() }),
    });
    scx.expiring_gets.insert(eg.id, eg.clone());
    scx.stats.expiring_gets.inc();
    log::trace!("expiring get {} on {} started, timeout: {:?}", eg.id, destination.name(), timeout);

    let handler: DeliveryFn = {
        let eg = eg.clone();
        Box::new(move |consumer, msg| eg.message_arrived(consumer, msg))
    };
    let on_destroyed: DestroyedFn = {
        let eg = eg.clone();
        Box::new(move |_| eg.consumer_destroyed_async())
    };
    let on_created: CreatedFn = {
        let eg = eg.clone();
        Box::new(move |rc| eg.consumer_created_async(rc))
    };

    match session.create_consumer(destination, handler, Some(on_destroyed), on_created) {
        Ok(Created::Ready(consumer)) => {
            let mut inner = eg.inner.lock();
            inner.consumer = Some(consumer);
            eg.consumer_created(inner, true)
        }
        Ok(Created::Pending) => Ok(CallStatus::AsyncCompletion),
        Err(e) => {
            log::debug!("expiring get {} could not create its consumer, {}", eg.id, e);
            session.release();
            eg.unregister();
            Err(e)
        }
    }
}

impl ExpiringGet {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn consumer_created(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner>, inline: bool) -> Result<CallStatus> {
        let mut destroy = None;
        if inner.message_delivered {
            inner.timer_finished = true;
            if !inner.consumer_destroy_started {
                destroy = Some(ConsumerFlags::DESTROY_MSG_ARRIVED);
            }
        } else if inner.consumer_destroy_started {
            // torn down while we were constructing, no timer needed
            inner.timer_finished = true;
        } else if self.timeout.is_zero() {
            inner.timer_finished = true;
            destroy = Some(ConsumerFlags::DESTROY_NO_TIMER);
        } else {
            self.scx.stats.timer_events_requested.inc();
            inner.event_count |= EventCount::INCREASED_CREATION;
            let eg = self.clone();
            match self.scx.timers.schedule_once(CLASS, self.timeout, move || eg.timer_expired()) {
                Some(key) => {
                    inner.timer_key = Some(key);
                    inner.timer_created = true;
                }
                None => {
                    self.scx.stats.timer_events_requested.dec();
                    inner.error = Some(EngineError::TimerUnavailable);
                    inner.timer_finished = true;
                    ffdc::capture("expiring get timer could not be scheduled", &*inner);
                    destroy = Some(ConsumerFlags::DESTROY_CREATE_FAILED);
                }
            }
        }
        inner.construction_finished = true;

        let step = match destroy {
            Some(reason) => {
                inner.consumer_flags |= reason;
                self.destroy_consumer(inner, inline)
            }
            None if inner.consumer_destroy_finished => {
                drop(inner);
                Step::Finished(self.finished(inline))
            }
            None => Step::Pending(inner),
        };
        match step {
            Step::Pending(_) => Ok(CallStatus::AsyncCompletion),
            Step::Finished(rc) => rc.map(|()| CallStatus::Completed),
        }
    }

    fn consumer_created_async(self: &Arc<Self>, rc: Result<Arc<Consumer>>) {
        let e = match rc {
            Ok(consumer) => {
                let mut inner = self.inner.lock();
                inner.consumer = Some(consumer);
                let _ = self.consumer_created(inner, false);
                return;
            }
            Err(e) => e,
        };

        log::debug!("expiring get {} consumer creation failed, {}", self.id, e);
        let on_complete = {
            let mut inner = self.inner.lock();
            inner.error = Some(e.clone());
            inner.consumer_flags |= ConsumerFlags::DESTROY_CREATE_FAILED;
            inner.take_completion()
        };
        if let Some(cb) = on_complete {
            cb(Err(e.clone()));
        }

        let mut inner = self.inner.lock();
        inner.construction_finished = true;
        inner.timer_finished = true;
        if !e.is_destroyed() {
            // the failed consumer was unwound without a destroy callback
            inner.consumer_destroy_started = true;
            inner.consumer_destroy_finished = true;
        }
        if inner.consumer_destroy_finished {
            drop(inner);
            let _ = self.finished(false);
        }
    }

    /// Delivery handler of the private consumer; never wants a second message.
    fn message_arrived(self: &Arc<Self>, consumer: &Arc<Consumer>, msg: Message) -> bool {
        let on_message = self.on_message.lock().take();
        match on_message {
            Some(cb) => cb(msg),
            None => {
                ffdc::capture("expiring get was handed a second message", self.as_ref());
                return false;
            }
        }

        let mut inner = self.inner.lock();
        inner.message_delivered = true;
        if inner.consumer.is_none() {
            inner.consumer = Some(consumer.clone());
        }
        if inner.timer_created && !inner.timer_finished {
            self.cancel_timer(&mut inner);
        } else if !inner.timer_finished {
            inner.timer_finished = true;
            inner.cancel_state |= CancelState::MSG_ARRIVED_NO_TIMER;
        } else {
            inner.cancel_state |= CancelState::ALREADY_FINISHED;
        }

        if inner.construction_finished && !inner.consumer_destroy_started {
            inner.consumer_flags |= ConsumerFlags::DESTROY_MSG_ARRIVED;
            let _ = self.destroy_consumer(inner, false);
        }
        false
    }

    fn cancel_timer(&self, inner: &mut Inner) {
        inner.cancel_state |= CancelState::BY_FUNC;
        match inner.timer_key.take() {
            Some(key) => {
                self.scx.stats.timer_events_requested.dec();
                inner.event_count |= EventCount::DEC_CANCELLED;
                if let Err(e) = self.scx.timers.cancel(key) {
                    inner.cancel_state |= CancelState::CANCEL_FAILED;
                    ffdc::fatal("expiring get timer cancel failed", &(e, &*inner));
                }
            }
            None => inner.cancel_state |= CancelState::NO_KEY,
        }
        inner.timer_finished = true;
    }

    /// Timer body, on the timer class thread.
    fn timer_expired(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.timer_finished {
            // cancelled after the body was already on its way
            inner.fired_state |= FiredState::TOO_LATE;
            return;
        }
        inner.fired_state |= FiredState::FIRED;
        inner.timer_finished = true;
        inner.timer_fired_thread = Some(thread::current().id());
        if inner.timer_key.take().is_some() {
            self.scx.stats.timer_events_requested.dec();
            inner.cancel_state |= CancelState::WHEN_FIRED;
            inner.event_count |= EventCount::DEC_FIRED;
        } else {
            inner.fired_state |= FiredState::NO_KEY;
        }
        log::trace!("expiring get {} timed out", self.id);

        if !inner.consumer_destroy_started {
            inner.consumer_flags |= ConsumerFlags::DESTROY_TIMER_FIRED;
            let _ = self.destroy_consumer(inner, false);
        }
    }

    /// Start destroying the private consumer. The lock is released around the
    /// destroy call itself, which may enqueue a store completion.
    fn destroy_consumer<'a>(self: &'a Arc<Self>, mut inner: MutexGuard<'a, Inner>, inline: bool) -> Step<'a> {
        inner.consumer_destroy_started = true;
        let consumer = match inner.consumer.clone() {
            Some(c) => c,
            None => ffdc::fatal("expiring get destroying a consumer it never had", &*inner),
        };
        drop(inner);

        let rc = consumer.destroy();
        let inner = self.inner.lock();
        match rc {
            Ok(CallStatus::Completed) => self.consumer_destroyed(inner, inline),
            Ok(CallStatus::AsyncCompletion) => Step::Pending(inner),
            Err(EngineError::Destroyed) => {
                // a recursive destroy owns the completion
                log::debug!("expiring get {} consumer {} already being destroyed", self.id, consumer.id());
                Step::Pending(inner)
            }
            Err(e) => ffdc::fatal("expiring get consumer destroy failed", &(e, &*inner)),
        }
    }

    /// Destroy callback of the private consumer. Either our own destroy went
    /// out of line, or the session tore the consumer down.
    fn consumer_destroyed_async(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.consumer_flags |= ConsumerFlags::DESTROYED_ASYNC;
        if !inner.consumer_destroy_started {
            inner.recursively_destroyed = true;
            inner.consumer_destroy_started = true;
            if inner.timer_created && !inner.timer_finished {
                self.cancel_timer(&mut inner);
            } else {
                inner.timer_finished = true;
            }
        }
        let _ = self.consumer_destroyed(inner, false);
    }

    fn consumer_destroyed<'a>(self: &'a Arc<Self>, mut inner: MutexGuard<'a, Inner>, inline: bool) -> Step<'a> {
        if !inner.timer_finished {
            ffdc::capture("expiring get consumer destroyed with a live timer", &*inner);
        }
        inner.consumer_destroy_finished = true;
        if !inner.construction_finished {
            return Step::Pending(inner);
        }
        inner.consumer_flags |= ConsumerFlags::DESTROY_ON_COMPLETE;
        drop(inner);
        Step::Finished(self.finished(inline))
    }

    /// Construction and consumer destruction are both finished. Report the
    /// outcome, out of line only, and hand the request over for release.
    fn finished(self: &Arc<Self>, inline: bool) -> Result<()> {
        let (outcome, on_complete) = {
            let mut inner = self.inner.lock();
            if inner.done {
                ffdc::fatal("expiring get finished twice", &*inner);
            }
            inner.done = true;
            (inner.outcome(), inner.take_completion())
        };
        log::trace!("expiring get {} finished, inline: {}, {:?}", self.id, inline, outcome);

        if !inline {
            if let Some(cb) = on_complete {
                cb(outcome.clone());
            }
        }
        self.session.release();
        self.schedule_final_release();
        outcome
    }

    fn schedule_final_release(self: &Arc<Self>) {
        self.scx.stats.timer_events_requested.inc();
        self.inner.lock().event_count |= EventCount::FREE_STARTED;

        let target = self.scx.timers.thread_of(CLASS);
        let job = {
            let eg = self.clone();
            Job::new("expiring-get-release", move |_| eg.final_release(false))
        };
        let rejected = match self.scx.thread_jobs.schedule(target, job) {
            Ok(()) => return,
            Err(e) => e,
        };
        log::debug!("release job of expiring get {} not scheduled, {}, using a timer", self.id, rejected.reason);
        drop(rejected);

        let eg = self.clone();
        if self.scx.timers.schedule_once(CLASS, Duration::ZERO, move || eg.final_release(false)).is_some() {
            return;
        }
        ffdc::capture("expiring get release could not be scheduled", self.as_ref());
        self.final_release(true);
    }

    fn final_release(&self, direct: bool) {
        let (consumer, on_complete) = {
            let mut inner = self.inner.lock();
            inner.event_count |= EventCount::FREE_FIRED;
            if !direct {
                if let Some(fired_on) = inner.timer_fired_thread {
                    if fired_on != thread::current().id() {
                        ffdc::capture("expiring get released off the thread its timer fired on", &*inner);
                    }
                }
            }
            (inner.consumer.take(), inner.on_complete.take())
        };
        drop(self.on_message.lock().take());
        drop(on_complete);
        drop(consumer);

        self.scx.stats.timer_events_requested.dec();
        self.unregister();
        log::trace!("expiring get {} released", self.id);
    }

    fn unregister(&self) {
        if self.scx.expiring_gets.remove(&self.id).is_some() {
            self.scx.stats.expiring_gets.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use bytes::Bytes;
    use rand::Rng;
    use simple_logger::SimpleLogger;

    use super::*;
    use crate::conf::{Inner as ConfInner, Settings};
    use crate::session::ClientState;
    use crate::store::{CommitCallback, Store};

    /// Fails every commit from another thread.
    #[derive(Debug)]
    struct OfflineStore;

    impl Store for OfflineStore {
        fn commit(&self, on_commit: CommitCallback) -> Result<CallStatus> {
            thread::spawn(move || on_commit(Err(EngineError::Msg("store offline".into()))));
            Ok(CallStatus::AsyncCompletion)
        }
    }

    fn engine(fake_async: bool) -> EngineContext {
        engine_with(64, fake_async)
    }

    fn engine_with(job_queue_capacity: usize, fake_async: bool) -> EngineContext {
        let _ = SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
        let mut inner = ConfInner::default();
        inner.engine.thread_job_queue_capacity = job_queue_capacity;
        inner.store.fake_async = fake_async;
        inner.store.fake_async_callback_capacity = 16;
        inner.store.fake_async_callback_threads = 1;
        EngineContext::new(Settings::from(inner)).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    type Received = mpsc::Receiver<Bytes>;
    type Completed = mpsc::Receiver<Result<()>>;

    fn callbacks() -> (MessageFn, CompletionFn, Received, Completed) {
        let (mtx, mrx) = mpsc::channel();
        let (ctx, crx) = mpsc::channel();
        let on_message: MessageFn = Box::new(move |msg| mtx.send(msg.payload).unwrap());
        let on_complete: CompletionFn = Box::new(move |rc| {
            let _ = ctx.send(rc);
        });
        (on_message, on_complete, mrx, crx)
    }

    fn session(scx: &EngineContext, client: &str) -> (Arc<ClientState>, Arc<Session>) {
        let client = scx.create_client(client);
        let session = client.create_session().unwrap();
        (client, session)
    }

    #[test]
    fn queued_message_completes_inline() {
        let scx = engine(false);
        let (_client, session) = session(&scx, "c1");
        let dest = scx.destination("q1", false);
        dest.put(Message::new("hello"));

        let (on_message, on_complete, mrx, crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_secs(5), on_message, on_complete);
        assert_eq!(rc.unwrap(), CallStatus::Completed);
        assert_eq!(mrx.try_recv().unwrap(), Bytes::from("hello"));
        assert!(mrx.try_recv().is_err());
        assert_eq!(dest.consumers(), 0);
        assert_eq!(session.use_count(), 1);

        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        assert!(crx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(scx.timers.pending(), 0);
        scx.shutdown();
    }

    #[test]
    fn message_within_timeout_completes_once() {
        let scx = engine(false);
        let (_client, session) = session(&scx, "c1");
        let dest = scx.destination("q1", false);

        let (on_message, on_complete, mrx, crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_secs(5), on_message, on_complete);
        assert_eq!(rc.unwrap(), CallStatus::AsyncCompletion);
        assert_eq!(scx.timers.pending(), 1);

        let producer = {
            let dest = dest.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                dest.put(Message::new("first"));
                dest.put(Message::new("second"));
            })
        };
        producer.join().unwrap();

        assert!(crx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
        assert_eq!(mrx.recv().unwrap(), Bytes::from("first"));
        assert!(mrx.try_recv().is_err());
        assert!(crx.recv_timeout(Duration::from_millis(50)).is_err());

        // the second message stays queued for somebody else
        assert_eq!(dest.queued(), 1);
        assert_eq!(dest.consumers(), 0);
        assert_eq!(scx.timers.pending(), 0);
        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        assert!(wait_until(|| session.use_count() == 1));
        scx.shutdown();
    }

    #[test]
    fn no_traffic_times_out() {
        let scx = engine(false);
        let (_client, session) = session(&scx, "c1");
        let dest = scx.destination("quiet", false);

        let (on_message, on_complete, mrx, crx) = callbacks();
        let started = Instant::now();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_millis(50), on_message, on_complete);
        assert_eq!(rc.unwrap(), CallStatus::AsyncCompletion);

        let outcome = crx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(outcome.unwrap_err(), EngineError::NoMessageAvailable);
        assert!(mrx.try_recv().is_err());
        assert_eq!(dest.consumers(), 0);

        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        assert_eq!(scx.stats.timer_events_requested.count(), 0);
        assert_eq!(scx.stats.expiring_gets.count(), 0);

        // later traffic is not consumed by the finished request
        dest.put(Message::new("late"));
        assert_eq!(dest.queued(), 1);
        scx.shutdown();
    }

    #[test]
    fn zero_timeout_checks_once() {
        let scx = engine(false);
        let (_client, session) = session(&scx, "c1");
        let dest = scx.destination("once", false);

        let (on_message, on_complete, _mrx, crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::ZERO, on_message, on_complete);
        assert_eq!(rc.unwrap_err(), EngineError::NoMessageAvailable);
        assert!(crx.recv_timeout(Duration::from_millis(50)).is_err());

        dest.put(Message::new("ready"));
        let (on_message, on_complete, mrx, _crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::ZERO, on_message, on_complete);
        assert_eq!(rc.unwrap(), CallStatus::Completed);
        assert_eq!(mrx.try_recv().unwrap(), Bytes::from("ready"));

        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        assert_eq!(session.use_count(), 1);
        assert_eq!(scx.timers.pending(), 0);
        scx.shutdown();
    }

    #[test]
    fn release_runs_on_the_timer_thread() {
        let scx = engine(false);
        let (_client, session) = session(&scx, "c1");
        let dest = scx.destination("q1", false);
        let timer_thread = scx.thread_jobs.get(scx.timers.thread_of(TimerClass::Low)).unwrap();
        let before = timer_thread.processed();

        let (on_message, on_complete, _mrx, _crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::ZERO, on_message, on_complete);
        assert!(rc.is_err());
        assert!(wait_until(|| timer_thread.processed() > before));
        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        scx.shutdown();
    }

    #[test]
    fn session_teardown_reports_destroyed_exactly_once() {
        let scx = engine(false);
        let dest = scx.destination("racy", false);
        let mut rng = rand::rng();

        for round in 0..50 {
            let (_client, session) = session(&scx, &format!("racer-{round}"));
            let delay = Duration::from_micros(rng.random_range(0..2000));
            let (stx, srx) = mpsc::channel();
            let destroyer = {
                let session = session.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    let rc = session.destroy(Box::new(move |rc| stx.send(rc).unwrap()));
                    assert!(rc.is_ok());
                    rc.unwrap()
                })
            };

            let (on_message, on_complete, mrx, crx) = callbacks();
            let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_secs(5), on_message, on_complete);
            let mut destroyed = 0;
            match rc {
                Err(EngineError::Destroyed) => destroyed += 1,
                Ok(CallStatus::AsyncCompletion) => {
                    let outcome = crx.recv_timeout(Duration::from_secs(5)).unwrap();
                    assert_eq!(outcome.unwrap_err(), EngineError::Destroyed);
                    destroyed += 1;
                }
                other => panic!("round {round}: unexpected {other:?}"),
            }
            assert!(crx.recv_timeout(Duration::from_millis(5)).is_err());
            assert_eq!(destroyed, 1);
            assert!(mrx.try_recv().is_err());

            if destroyer.join().unwrap() == CallStatus::AsyncCompletion {
                assert!(srx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
            }
            assert_eq!(dest.consumers(), 0);
        }

        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        assert_eq!(scx.timers.pending(), 0);
        assert_eq!(scx.stats.timer_events_requested.count(), 0);
        scx.shutdown();
    }

    #[test]
    fn durable_destination_completes_through_the_store() {
        let scx = engine(true);
        let (_client, session) = session(&scx, "durable");
        let dest = scx.destination("dq", true);

        let (on_message, on_complete, mrx, crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_secs(5), on_message, on_complete);
        assert_eq!(rc.unwrap(), CallStatus::AsyncCompletion);

        dest.put(Message::new("stored"));
        assert!(crx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
        assert_eq!(mrx.recv_timeout(Duration::from_secs(5)).unwrap(), Bytes::from("stored"));
        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        assert!(wait_until(|| session.use_count() == 1));
        scx.shutdown();
    }

    #[test]
    fn durable_timeout_with_paused_store() {
        let scx = engine(true);
        let (_client, session) = session(&scx, "durable");
        let dest = scx.destination("dq", true);
        let dispatcher = scx.fake_async.clone().unwrap();

        dispatcher.pause();
        let (on_message, on_complete, _mrx, crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_millis(20), on_message, on_complete);
        assert_eq!(rc.unwrap(), CallStatus::AsyncCompletion);
        // creation is parked in the dispatcher, no timer yet
        assert!(crx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(dispatcher.len(), 1);

        dispatcher.resume();
        assert_eq!(crx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err(), EngineError::NoMessageAvailable);
        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        scx.shutdown();
    }

    #[test]
    fn timer_unavailable_is_reported_inline_and_released_directly() {
        let scx = engine(false);
        let (_client, session) = session(&scx, "c1");
        let dest = scx.destination("q1", false);
        scx.timers.shutdown();
        let captures = ffdc::captures();

        let (on_message, on_complete, mrx, crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_secs(1), on_message, on_complete);
        assert_eq!(rc.unwrap_err(), EngineError::TimerUnavailable);
        assert!(crx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(mrx.try_recv().is_err());

        // neither the timer thread's queue nor a timer could take the release
        assert!(ffdc::captures() >= captures + 2);
        assert!(scx.expiring_gets.is_empty());
        assert_eq!(scx.stats.timer_events_requested.count(), 0);
        assert_eq!(dest.consumers(), 0);
        assert_eq!(session.use_count(), 1);
        scx.shutdown();
    }

    #[test]
    fn release_falls_back_to_a_timer_when_the_job_queue_is_full() {
        let scx = engine_with(2, false);
        let (_client, session) = session(&scx, "c1");
        let dest = scx.destination("q1", false);
        let target = scx.timers.thread_of(CLASS);

        // park the timer thread inside a callback so it cannot drain its queue
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        scx.timers
            .schedule_once(CLASS, Duration::ZERO, move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut queued = 0;
        while scx.thread_jobs.schedule(target, Job::new("filler", |_| {})).is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 1);

        let (on_message, on_complete, _mrx, _crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::ZERO, on_message, on_complete);
        assert_eq!(rc.unwrap_err(), EngineError::NoMessageAvailable);
        assert_eq!(scx.timers.pending(), 1);
        assert_eq!(scx.expiring_gets.len(), 1);

        gate_tx.send(()).unwrap();
        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        assert_eq!(scx.timers.pending(), 0);
        assert_eq!(scx.stats.timer_events_requested.count(), 0);
        scx.shutdown();
    }

    #[test]
    fn async_creation_failure_completes_once_with_the_error() {
        let scx = engine(false);
        let client = ClientState::new("offline", Arc::new(OfflineStore), scx.stats.clone());
        let session = client.create_session().unwrap();
        let dest = scx.destination("dq", true);

        let (on_message, on_complete, mrx, crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_secs(5), on_message, on_complete);
        assert_eq!(rc.unwrap(), CallStatus::AsyncCompletion);

        let outcome = crx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.unwrap_err(), EngineError::Msg("store offline".into()));
        assert!(crx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(mrx.try_recv().is_err());

        assert!(wait_until(|| scx.expiring_gets.is_empty()));
        assert!(wait_until(|| session.use_count() == 1));
        assert_eq!(dest.consumers(), 0);
        assert_eq!(scx.timers.pending(), 0);
        scx.shutdown();
    }

    #[test]
    fn destroyed_session_is_refused() {
        let scx = engine(false);
        let (_client, session) = session(&scx, "gone");
        let dest = scx.destination("q1", false);
        assert_eq!(session.destroy(Box::new(|_| {})).unwrap(), CallStatus::Completed);

        let (on_message, on_complete, _mrx, _crx) = callbacks();
        let rc = get_message_with_timeout(&scx, &session, &dest, Duration::from_secs(1), on_message, on_complete);
        assert_eq!(rc.unwrap_err(), EngineError::Destroyed);
        assert!(scx.expiring_gets.is_empty());
        assert_eq!(scx.stats.expiring_gets.count(), 0);
        scx.shutdown();
    }
}
