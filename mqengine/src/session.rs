//! Clients, sessions, consumers and destinations.
//!
//! Lifetimes follow explicit use counts rather than `Arc` strong counts: a
//! session stays usable until `destroy` has been called *and* every holder
//! (its consumers, in-flight timed receives) has released its reference. Only
//! then does the session's destroy callback fire.
//!
//! Lock order is destination, then consumer state. Handlers and callbacks
//! always run with no engine lock held.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::ffdc;
use crate::stats::Stats;
use crate::store::Store;
use crate::{CallStatus, EngineError, Result};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub payload: Bytes,
}

impl Message {
    #[inline]
    pub fn new<B: Into<Bytes>>(payload: B) -> Self {
        Self { id: next_id(), payload: payload.into() }
    }
}

/// Called for each message handed to a consumer; returns whether the
/// consumer wants another one.
pub type DeliveryFn = Box<dyn FnMut(&Arc<Consumer>, Message) -> bool + Send>;
pub type DestroyedFn = Box<dyn FnOnce(Result<()>) + Send>;
pub type CreatedFn = Box<dyn FnOnce(Result<Arc<Consumer>>) + Send>;

/// A point-to-point destination. Messages wait in FIFO order until an enabled
/// consumer is attached.
pub struct Destination {
    name: String,
    durable: bool,
    inner: Mutex<DestinationInner>,
    stats: Arc<Stats>,
}

#[derive(Default)]
struct DestinationInner {
    messages: VecDeque<Message>,
    consumers: Vec<Arc<Consumer>>,
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "Destination {{ name: {}, durable: {}, messages: {}, consumers: {} }}",
            self.name,
            self.durable,
            inner.messages.len(),
            inner.consumers.len()
        )
    }
}

impl Destination {
    pub fn new(name: &str, durable: bool, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new(Self { name: name.to_owned(), durable, inner: Mutex::new(DestinationInner::default()), stats })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consumer creation and destruction on a durable destination go through
    /// the store.
    #[inline]
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.inner.lock().messages.len()
    }

    #[inline]
    pub fn consumers(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Queue `msg` and hand queued messages to whichever consumers can take them.
    pub fn put(&self, msg: Message) {
        self.inner.lock().messages.push_back(msg);
        self.stats.destination_messages.inc();
        self.dispatch_queued();
    }

    fn attach(&self, consumer: Arc<Consumer>) {
        self.inner.lock().consumers.push(consumer);
        self.dispatch_queued();
    }

    fn detach(&self, consumer_id: u64) {
        self.inner.lock().consumers.retain(|c| c.id != consumer_id);
    }

    fn dispatch_queued(&self) {
        loop {
            let (consumer, msg) = {
                let mut inner = self.inner.lock();
                if inner.messages.is_empty() {
                    return;
                }
                let consumer = match inner.consumers.iter().find(|c| c.try_begin_delivery()) {
                    Some(c) => c.clone(),
                    None => return,
                };
                match inner.messages.pop_front() {
                    Some(msg) => (consumer, msg),
                    None => return,
                }
            };
            self.stats.destination_messages.dec();
            consumer.deliver(msg);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestroyState {
    Live,
    Requested,
    Done,
}

struct ConsumerState {
    destroy: DestroyState,
    enabled: bool,
    delivering: usize,
    commits_pending: usize,
    notify: bool,
    on_destroyed: Option<DestroyedFn>,
    on_created: Option<CreatedFn>,
}

/// Taken by whichever transition completes a destroy.
struct Finished {
    notify: bool,
    on_destroyed: Option<DestroyedFn>,
}

impl ConsumerState {
    /// Move a requested destroy to `Done` once no delivery or commit is in
    /// flight. Only one caller ever gets `Some`.
    fn complete_destroy(&mut self) -> Option<Finished> {
        if self.destroy != DestroyState::Requested || self.delivering > 0 || self.commits_pending > 0 {
            return None;
        }
        self.destroy = DestroyState::Done;
        Some(Finished { notify: self.notify, on_destroyed: self.on_destroyed.take() })
    }
}

impl fmt::Debug for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerState")
            .field("destroy", &self.destroy)
            .field("enabled", &self.enabled)
            .field("delivering", &self.delivering)
            .field("commits_pending", &self.commits_pending)
            .field("notify", &self.notify)
            .field("on_destroyed", &self.on_destroyed.is_some())
            .finish()
    }
}

pub struct Consumer {
    id: u64,
    session: Arc<Session>,
    destination: Arc<Destination>,
    handler: Mutex<Option<DeliveryFn>>,
    state: Mutex<ConsumerState>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Consumer {{ id: {}, destination: {}, state: {:?} }}", self.id, self.destination.name, self.state.lock())
    }
}

impl Consumer {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[inline]
    pub fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        let st = self.state.lock();
        st.enabled && st.destroy == DestroyState::Live
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroy == DestroyState::Done
    }

    /// Start destroying the consumer.
    ///
    /// `Completed`: fully destroyed, the destroy callback will not fire.
    /// `AsyncCompletion`: a delivery or store commit is still in flight, the
    /// destroy callback fires once it ends. `Destroyed`: someone else got here first.
    pub fn destroy(self: &Arc<Self>) -> Result<CallStatus> {
        self.begin_destroy(false)
    }

    /// Destroy on behalf of the owning session; the destroy callback always fires.
    fn destroy_recursive(self: &Arc<Self>) -> Result<CallStatus> {
        self.begin_destroy(true)
    }

    fn begin_destroy(self: &Arc<Self>, recursive: bool) -> Result<CallStatus> {
        {
            let mut st = self.state.lock();
            if st.destroy != DestroyState::Live {
                return Err(EngineError::Destroyed);
            }
            st.destroy = DestroyState::Requested;
            st.enabled = false;
            st.notify = recursive;
        }

        self.destination.detach(self.id);
        self.session.detach_consumer(self.id);

        if self.destination.durable {
            self.state.lock().commits_pending += 1;
            let me = self.clone();
            match self.session.store.commit(Box::new(move |rc| me.commit_finished(rc))) {
                Ok(CallStatus::AsyncCompletion) => {}
                Ok(CallStatus::Completed) => self.state.lock().commits_pending -= 1,
                Err(e) => {
                    log::warn!("store commit for consumer {} destroy failed, {}", self.id, e);
                    self.state.lock().commits_pending -= 1;
                }
            }
        }

        let mut st = self.state.lock();
        if st.destroy == DestroyState::Done {
            // a commit completion finished it before we looked, without notifying
            return Ok(CallStatus::Completed);
        }
        match st.complete_destroy() {
            Some(finished) => {
                drop(st);
                self.finish_destroy(finished);
                Ok(CallStatus::Completed)
            }
            None => {
                st.notify = true;
                Ok(CallStatus::AsyncCompletion)
            }
        }
    }

    fn finish_destroy(&self, finished: Finished) {
        drop(self.handler.lock().take());
        self.session.stats.consumers.dec();
        log::debug!("consumer {} on {} destroyed", self.id, self.destination.name);

        if finished.notify {
            if let Some(cb) = finished.on_destroyed {
                cb(Ok(()));
            }
        }
        self.session.release();
    }

    /// Store completion for either the create or the destroy commit.
    fn commit_finished(self: &Arc<Self>, rc: Result<()>) {
        let (on_created, attach) = {
            let mut st = self.state.lock();
            st.commits_pending -= 1;
            let on_created = st.on_created.take();
            let attach = on_created.is_some() && rc.is_ok() && st.destroy == DestroyState::Live;
            (on_created, attach)
        };

        if let Some(on_created) = on_created {
            if attach {
                self.attach();
                on_created(Ok(self.clone()));
            } else if let Err(e) = rc {
                let unwind = {
                    let mut st = self.state.lock();
                    if st.destroy == DestroyState::Live {
                        // creation failed outright, unwind it without a destroy callback
                        st.on_destroyed = None;
                        true
                    } else {
                        false
                    }
                };
                if unwind {
                    let _ = self.destroy();
                }
                on_created(Err(e));
            } else {
                on_created(Err(EngineError::Destroyed));
            }
        }

        let finished = self.state.lock().complete_destroy();
        if let Some(finished) = finished {
            self.finish_destroy(finished);
        }
    }

    fn attach(self: &Arc<Self>) {
        self.destination.attach(self.clone());
        if self.state.lock().destroy != DestroyState::Live {
            // lost a race with destroy, which detached before we attached
            self.destination.detach(self.id);
        }
    }

    fn try_begin_delivery(&self) -> bool {
        let mut st = self.state.lock();
        if st.enabled && st.destroy == DestroyState::Live && st.delivering == 0 {
            st.delivering += 1;
            true
        } else {
            false
        }
    }

    fn deliver(self: &Arc<Self>, msg: Message) {
        let mut handler = self.handler.lock().take();
        let more = match handler.as_mut() {
            Some(h) => h(self, msg),
            None => false,
        };

        let finished = {
            let mut st = self.state.lock();
            if !more {
                st.enabled = false;
            }
            if st.destroy == DestroyState::Live {
                *self.handler.lock() = handler.take();
            }
            st.delivering -= 1;
            st.complete_destroy()
        };
        drop(handler);
        if let Some(finished) = finished {
            self.finish_destroy(finished);
        }
    }
}

#[derive(Default)]
struct SessionState {
    destroying: bool,
    consumers: HashMap<u64, Arc<Consumer>>,
    on_destroyed: Option<DestroyedFn>,
}

pub struct Session {
    id: u64,
    client: Weak<ClientState>,
    store: Arc<dyn Store>,
    stats: Arc<Stats>,
    use_count: AtomicUsize,
    state: Mutex<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        write!(
            f,
            "Session {{ id: {}, use_count: {}, destroying: {}, consumers: {} }}",
            self.id,
            self.use_count(),
            st.destroying,
            st.consumers.len()
        )
    }
}

/// Result of [`Session::create_consumer`].
#[derive(Debug)]
pub enum Created {
    /// Created and attached before returning
    Ready(Arc<Consumer>),
    /// Creation finishes through the `on_created` callback
    Pending,
}

impl Session {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_destroying(&self) -> bool {
        self.state.lock().destroying
    }

    #[inline]
    pub fn consumers(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Take a reference that keeps the session from finishing its destroy.
    pub fn acquire(&self) -> Result<()> {
        let st = self.state.lock();
        if st.destroying {
            return Err(EngineError::Destroyed);
        }
        self.use_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drop a reference taken by [`Session::acquire`].
    pub fn release(&self) {
        if self.release_ref() {
            let cb = self.state.lock().on_destroyed.take();
            if let Some(cb) = cb {
                cb(Ok(()));
            }
        }
    }

    fn release_ref(&self) -> bool {
        let prev = self.use_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            ffdc::fatal("session use count released below zero", self);
        }
        if prev > 1 {
            return false;
        }
        self.stats.sessions.dec();
        if let Some(client) = self.client.upgrade() {
            client.remove_session(self.id);
        }
        log::debug!("session {} destroyed", self.id);
        true
    }

    /// Create a consumer on `destination`. `on_destroyed` is the consumer's
    /// pending destroy callback, registered before the consumer is visible.
    pub fn create_consumer(
        self: &Arc<Self>,
        destination: &Arc<Destination>,
        handler: DeliveryFn,
        on_destroyed: Option<DestroyedFn>,
        on_created: CreatedFn,
    ) -> Result<Created> {
        let consumer = Arc::new(Consumer {
            id: next_id(),
            session: self.clone(),
            destination: destination.clone(),
            handler: Mutex::new(Some(handler)),
            state: Mutex::new(ConsumerState {
                destroy: DestroyState::Live,
                enabled: true,
                delivering: 0,
                commits_pending: 0,
                notify: false,
                on_destroyed,
                on_created: None,
            }),
        });

        {
            let mut st = self.state.lock();
            if st.destroying {
                return Err(EngineError::Destroyed);
            }
            self.use_count.fetch_add(1, Ordering::SeqCst);
            st.consumers.insert(consumer.id, consumer.clone());
        }
        self.stats.consumers.inc();

        if !destination.durable {
            consumer.attach();
            return Ok(Created::Ready(consumer));
        }

        {
            let mut st = consumer.state.lock();
            st.commits_pending += 1;
            st.on_created = Some(on_created);
        }
        let c = consumer.clone();
        match self.store.commit(Box::new(move |rc| c.commit_finished(rc))) {
            Ok(CallStatus::AsyncCompletion) => Ok(Created::Pending),
            Ok(CallStatus::Completed) => {
                {
                    let mut st = consumer.state.lock();
                    st.commits_pending -= 1;
                    st.on_created = None;
                }
                consumer.attach();
                Ok(Created::Ready(consumer))
            }
            Err(e) => {
                {
                    let mut st = consumer.state.lock();
                    st.commits_pending -= 1;
                    st.on_created = None;
                    st.on_destroyed = None;
                }
                let _ = consumer.destroy();
                Err(e)
            }
        }
    }

    fn detach_consumer(&self, consumer_id: u64) {
        self.state.lock().consumers.remove(&consumer_id);
    }

    /// Destroy the session and, recursively, every consumer on it.
    ///
    /// `Completed` when nothing else held the session; otherwise
    /// `on_destroyed` fires once the last reference is released.
    pub fn destroy(&self, on_destroyed: DestroyedFn) -> Result<CallStatus> {
        let consumers = {
            let mut st = self.state.lock();
            if st.destroying {
                return Err(EngineError::Destroyed);
            }
            st.destroying = true;
            st.on_destroyed = Some(on_destroyed);
            st.consumers.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };
        log::debug!("destroying session {} with {} consumers", self.id, consumers.len());

        for consumer in consumers {
            if let Err(e) = consumer.destroy_recursive() {
                log::debug!("consumer {} already being destroyed, {}", consumer.id, e);
            }
        }

        if self.release_ref() {
            self.state.lock().on_destroyed = None;
            Ok(CallStatus::Completed)
        } else {
            Ok(CallStatus::AsyncCompletion)
        }
    }
}

/// Shared countdown that fires a callback when the last participant arrives.
struct Countdown {
    remaining: AtomicUsize,
    callback: Mutex<Option<DestroyedFn>>,
}

impl Countdown {
    fn new(participants: usize, callback: DestroyedFn) -> Arc<Self> {
        Arc::new(Self { remaining: AtomicUsize::new(participants), callback: Mutex::new(Some(callback)) })
    }

    fn arrive(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::SeqCst) == 1
    }

    fn arrive_and_fire(&self) {
        if self.arrive() {
            let cb = self.callback.lock().take();
            if let Some(cb) = cb {
                cb(Ok(()));
            }
        }
    }
}

#[derive(Default)]
struct ClientInner {
    destroying: bool,
    sessions: HashMap<u64, Arc<Session>>,
}

/// Per-identity container of sessions.
pub struct ClientState {
    id: String,
    store: Arc<dyn Store>,
    stats: Arc<Stats>,
    inner: Mutex<ClientInner>,
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(f, "ClientState {{ id: {}, destroying: {}, sessions: {} }}", self.id, inner.destroying, inner.sessions.len())
    }
}

impl ClientState {
    pub fn new(id: &str, store: Arc<dyn Store>, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new(Self { id: id.to_owned(), store, stats, inner: Mutex::new(ClientInner::default()) })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn create_session(self: &Arc<Self>) -> Result<Arc<Session>> {
        let mut inner = self.inner.lock();
        if inner.destroying {
            return Err(EngineError::Destroyed);
        }
        let session = Arc::new(Session {
            id: next_id(),
            client: Arc::downgrade(self),
            store: self.store.clone(),
            stats: self.stats.clone(),
            use_count: AtomicUsize::new(1),
            state: Mutex::new(SessionState::default()),
        });
        inner.sessions.insert(session.id, session.clone());
        self.stats.sessions.inc();
        Ok(session)
    }

    fn remove_session(&self, session_id: u64) {
        self.inner.lock().sessions.remove(&session_id);
    }

    /// Destroy every session; `on_destroyed` fires once all of them are gone,
    /// unless everything finished before returning (`Completed`).
    pub fn destroy(&self, on_destroyed: DestroyedFn) -> Result<CallStatus> {
        let sessions = {
            let mut inner = self.inner.lock();
            if inner.destroying {
                return Err(EngineError::Destroyed);
            }
            inner.destroying = true;
            inner.sessions.values().cloned().collect::<Vec<_>>()
        };

        let countdown = Countdown::new(sessions.len() + 1, on_destroyed);
        for session in sessions {
            let cd = countdown.clone();
            match session.destroy(Box::new(move |_| cd.arrive_and_fire())) {
                Ok(CallStatus::AsyncCompletion) => {}
                Ok(CallStatus::Completed) | Err(_) => countdown.arrive_and_fire(),
            }
        }

        if countdown.arrive() {
            countdown.callback.lock().take();
            Ok(CallStatus::Completed)
        } else {
            Ok(CallStatus::AsyncCompletion)
        }
    }
}
