use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;

use crate::conf::Settings;
use crate::expiring_get::ExpiringGet;
use crate::fake_async::{ComponentStatus, FakeAsyncDispatcher};
use crate::session::{ClientState, Destination};
use crate::stats::Stats;
use crate::store::{FakeAsyncStore, Store, SyncStore};
use crate::threadjobs::{Affinity, ThreadData, ThreadJobs};
use crate::timer::TimerService;
use crate::{EngineError, Result};

/// Everything one engine instance shares between its threads. Cheap to clone;
/// several engines can live in one process.
#[derive(Clone)]
pub struct EngineContext {
    inner: Arc<EngineContextInner>,
}

pub struct EngineContextInner {
    pub settings: Settings,
    pub stats: Arc<Stats>,
    pub thread_jobs: Arc<ThreadJobs>,
    pub timers: TimerService,
    pub fake_async: Option<Arc<FakeAsyncDispatcher>>,
    pub store: Arc<dyn Store>,
    pub destinations: DashMap<String, Arc<Destination>, ahash::RandomState>,
    pub expiring_gets: DashMap<u64, Arc<ExpiringGet>, ahash::RandomState>,
}

impl Deref for EngineContext {
    type Target = EngineContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("thread_jobs", &self.thread_jobs)
            .field("timers", &self.timers)
            .field("fake_async", &self.fake_async)
            .field("destinations", &self.destinations.len())
            .field("expiring_gets", &self.expiring_gets.len())
            .finish()
    }
}

impl EngineContext {
    pub fn new(settings: Settings) -> Result<Self> {
        let stats = Arc::new(Stats::new());
        let thread_jobs = Arc::new(ThreadJobs::new(&settings.engine, stats.clone()));
        let timers = TimerService::start(&settings.timer, thread_jobs.clone(), stats.clone())?;

        let (fake_async, store): (_, Arc<dyn Store>) = if settings.store.fake_async {
            let dispatcher = Arc::new(FakeAsyncDispatcher::from_conf(&settings.store, stats.clone())?);
            (Some(dispatcher.clone()), Arc::new(FakeAsyncStore::new(dispatcher)))
        } else {
            (None, Arc::new(SyncStore))
        };

        log::info!(
            "engine context created, job queue capacity: {}, job queues disabled: {}, fake async store: {}",
            settings.engine.thread_job_queue_capacity,
            settings.engine.disable_thread_job_queues,
            settings.store.fake_async
        );

        Ok(Self {
            inner: Arc::new(EngineContextInner {
                settings,
                stats,
                thread_jobs,
                timers,
                fake_async,
                store,
                destinations: DashMap::default(),
                expiring_gets: DashMap::default(),
            }),
        })
    }

    /// Register the calling thread as an engine thread.
    #[inline]
    pub fn register_thread(&self, name: &str, affinity: Affinity) -> Result<Arc<ThreadData>> {
        self.thread_jobs.register(name, affinity, None)
    }

    /// Get the destination called `name`, creating it on first use.
    pub fn destination(&self, name: &str, durable: bool) -> Arc<Destination> {
        self.destinations
            .entry(name.to_owned())
            .or_insert_with(|| Destination::new(name, durable, self.stats.clone()))
            .value()
            .clone()
    }

    pub fn find_destination(&self, name: &str) -> Result<Arc<Destination>> {
        self.destinations
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| EngineError::DestinationNotFound(name.to_owned()))
    }

    #[inline]
    pub fn create_client(&self, id: &str) -> Arc<ClientState> {
        ClientState::new(id, self.store.clone(), self.stats.clone())
    }

    /// Backpressure flag for external monitoring.
    #[inline]
    pub fn status(&self) -> ComponentStatus {
        self.fake_async.as_ref().map(|d| d.status()).unwrap_or(ComponentStatus::Ok)
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let mut val = self.stats.to_json();
        if let Some(obj) = val.as_object_mut() {
            obj.insert("status".into(), json!(self.status()));
            obj.insert("engine_threads".into(), json!(self.thread_jobs.len()));
            obj.insert("expiring_gets.in_flight".into(), json!(self.expiring_gets.len()));
            if let Some(d) = self.fake_async.as_ref() {
                obj.insert("fake_async.capacity".into(), json!(d.capacity()));
            }
        }
        val
    }

    /// Stop the dispatcher first so its last callbacks can still post work to
    /// the timer threads, then stop the timer threads, which run their queued
    /// jobs on the way out.
    pub fn shutdown(&self) {
        if let Some(d) = self.fake_async.as_ref() {
            d.shutdown();
        }
        self.timers.shutdown();

        let in_flight = self.expiring_gets.len();
        if in_flight > 0 {
            log::warn!("engine stopped with {} timed receives still in flight", in_flight);
            self.expiring_gets.clear();
        }
        log::info!("engine context shut down");
    }
}
