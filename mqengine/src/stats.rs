//! Engine statistics.
//!
//! Plain [`Counter`] gauges bumped from the hot paths, serialised for external
//! monitoring by [`Stats::to_json`]. Counters that only ever grow (jobs
//! processed, queue-full rejections) use `count`; gauges (in-flight requests,
//! dispatcher depth) also report their high-water mark through `max`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ffdc;
use crate::utils::Counter;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub jobs_scheduled: Counter,
    pub jobs_processed: Counter,
    pub jobs_scavenged: Counter,
    pub job_queue_full: Counter,

    pub timers: Counter,
    pub timer_events_requested: Counter,
    pub expiring_gets: Counter,

    pub sessions: Counter,
    pub consumers: Counter,
    pub destination_messages: Counter,

    pub fake_async_callbacks: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "jobs_scheduled.count": self.jobs_scheduled.count(),
            "jobs_processed.count": self.jobs_processed.count(),
            "jobs_scavenged.count": self.jobs_scavenged.count(),
            "job_queue_full.count": self.job_queue_full.count(),

            "timers.count": self.timers.count(),
            "timers.max": self.timers.max(),
            "timer_events_requested.count": self.timer_events_requested.count(),
            "timer_events_requested.max": self.timer_events_requested.max(),
            "expiring_gets.count": self.expiring_gets.count(),
            "expiring_gets.max": self.expiring_gets.max(),

            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "consumers.count": self.consumers.count(),
            "consumers.max": self.consumers.max(),
            "destination_messages.count": self.destination_messages.count(),
            "destination_messages.max": self.destination_messages.max(),

            "fake_async_callbacks.count": self.fake_async_callbacks.count(),
            "fake_async_callbacks.max": self.fake_async_callbacks.max(),

            "ffdcs": ffdc::captures(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_show_up_in_json() {
        let stats = Stats::new();
        stats.expiring_gets.inc();
        stats.expiring_gets.inc();
        stats.expiring_gets.dec();
        stats.jobs_processed.incs(7);

        let val = stats.to_json();
        assert_eq!(val["expiring_gets.count"], 1);
        assert_eq!(val["expiring_gets.max"], 2);
        assert_eq!(val["jobs_processed.count"], 7);
        assert!(val["ffdcs"].is_u64());
    }
}
