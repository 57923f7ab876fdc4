use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Gauge with a high-water mark.
///
/// `count` is the live value, `max` the largest value ever observed through
/// [`Counter::inc`]/[`Counter::incs`]/[`Counter::sets`]. Decrements never lower `max`.
#[derive(Serialize, Deserialize, Default)]
pub struct Counter {
    count: AtomicIsize,
    max: AtomicIsize,
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter::new_with(self.count(), self.max())
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn new_with(count: isize, max: isize) -> Self {
        Counter { count: AtomicIsize::new(count), max: AtomicIsize::new(max) }
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: isize) {
        let prev = self.count.fetch_add(c, Ordering::SeqCst);
        self.max.fetch_max(prev + c, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) {
        self.count.fetch_sub(c, Ordering::SeqCst);
    }

    /// Overwrites the live value, raising the high-water mark if needed.
    #[inline]
    pub fn sets(&self, c: isize) {
        self.count.store(c, Ordering::SeqCst);
        self.max.fetch_max(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.max.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
            "max": self.max()
        })
    }
}
