#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use mqengine_utils::deserialize_duration;

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub timer: Timer,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Settings(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqengine/mqengine").required(false))
            .add_source(File::with_name("mqengine").required(false))
            .add_source(config::Environment::with_prefix("mqengine").separator("__").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(fake_async) = opts.fake_async {
            inner.store.fake_async = fake_async;
        }
        if let Some(capacity) = opts.thread_job_queue_capacity {
            inner.engine.thread_job_queue_capacity = capacity;
        }

        inner.validate()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    /// Process-wide default settings. Engines receive their settings explicitly,
    /// this is only the convenience instance for single-engine processes.
    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("engine config is: {:?}", self.engine);
        log::info!("timer config is: {:?}", self.timer);
        log::info!("store config is: {:?}", self.store);
    }
}

impl Inner {
    fn validate(&self) -> Result<()> {
        if !self.engine.disable_thread_job_queues && self.engine.thread_job_queue_capacity < 2 {
            return Err(anyhow!(
                "engine.thread_job_queue_capacity must be at least 2, got {}",
                self.engine.thread_job_queue_capacity
            ));
        }
        if self.store.fake_async {
            if self.store.fake_async_callback_capacity == 0 {
                return Err(anyhow!("store.fake_async_callback_capacity must not be 0"));
            }
            if self.store.fake_async_callback_threads == 0 {
                return Err(anyhow!("store.fake_async_callback_threads must not be 0"));
            }
            let max = self.store.fake_async_callback_max_capacity;
            if max != 0 && max < self.store.fake_async_callback_capacity {
                return Err(anyhow!(
                    "store.fake_async_callback_max_capacity ({}) is below the initial capacity ({})",
                    max,
                    self.store.fake_async_callback_capacity
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Engine {
    //Capacity of each engine thread's job queue, one slot is reserved as the separator.
    #[serde(default = "Engine::thread_job_queue_capacity_default")]
    pub thread_job_queue_capacity: usize,

    #[serde(default)]
    pub disable_thread_job_queues: bool,

    //Let threads run jobs queued for idle, stealable threads.
    #[serde(default = "Engine::thread_job_scavenger_default")]
    pub thread_job_scavenger: bool,
}

impl Default for Engine {
    #[inline]
    fn default() -> Self {
        Self {
            thread_job_queue_capacity: Self::thread_job_queue_capacity_default(),
            disable_thread_job_queues: false,
            thread_job_scavenger: Self::thread_job_scavenger_default(),
        }
    }
}

impl Engine {
    fn thread_job_queue_capacity_default() -> usize {
        32_768
    }
    fn thread_job_scavenger_default() -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Timer {
    //Upper bound on how long a timer thread sleeps before re-checking its queues.
    #[serde(default = "Timer::resolution_default", deserialize_with = "deserialize_duration")]
    pub resolution: Duration,
}

impl Default for Timer {
    #[inline]
    fn default() -> Self {
        Self { resolution: Self::resolution_default() }
    }
}

impl Timer {
    fn resolution_default() -> Duration {
        Duration::from_millis(500)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Store {
    //Complete commits on dedicated callback threads instead of inline.
    #[serde(default)]
    pub fake_async: bool,

    #[serde(default = "Store::fake_async_callback_capacity_default")]
    pub fake_async_callback_capacity: usize,

    #[serde(default = "Store::fake_async_callback_threads_default")]
    pub fake_async_callback_threads: usize,

    //0 means the callback buffer keeps doubling without limit.
    #[serde(default)]
    pub fake_async_callback_max_capacity: usize,
}

impl Default for Store {
    #[inline]
    fn default() -> Self {
        Self {
            fake_async: false,
            fake_async_callback_capacity: Self::fake_async_callback_capacity_default(),
            fake_async_callback_threads: Self::fake_async_callback_threads_default(),
            fake_async_callback_max_capacity: 0,
        }
    }
}

impl Store {
    fn fake_async_callback_capacity_default() -> usize {
        64_000
    }
    fn fake_async_callback_threads_default() -> usize {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_config_files() {
        let settings = Settings::new(Options::default()).expect("Settings creation failed");
        assert_eq!(settings.engine.thread_job_queue_capacity, 32_768);
        assert!(!settings.engine.disable_thread_job_queues);
        assert_eq!(settings.store.fake_async_callback_capacity, 64_000);
        assert_eq!(settings.store.fake_async_callback_max_capacity, 0);
    }

    #[test]
    fn options_override_files() {
        let test_cases = [(Some(true), Some(64), true, 64), (Some(false), None, false, 32_768)];

        for (fake_async, capacity, expected_fake, expected_capacity) in &test_cases {
            let opts =
                Options { fake_async: *fake_async, thread_job_queue_capacity: *capacity, ..Default::default() };
            let settings = Settings::new(opts).expect("Settings creation failed");
            assert_eq!(settings.store.fake_async, *expected_fake);
            assert_eq!(settings.engine.thread_job_queue_capacity, *expected_capacity);
        }
    }

    #[test]
    fn rejects_degenerate_queue_capacity() {
        let opts = Options { thread_job_queue_capacity: Some(1), ..Default::default() };
        assert!(Settings::new(opts).is_err());
    }

    #[test]
    fn rejects_ceiling_below_initial_capacity() {
        let mut inner = Inner::default();
        inner.store.fake_async = true;
        inner.store.fake_async_callback_capacity = 100;
        inner.store.fake_async_callback_max_capacity = 10;
        assert!(inner.validate().is_err());
    }
}
