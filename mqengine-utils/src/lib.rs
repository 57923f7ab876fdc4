//! Small helpers shared by the mqengine crates.
//!
//! - [`Counter`]: atomic gauge with a high-water mark, serialisable for monitoring
//! - duration strings ("1h30m", "250ms") for configuration files
//!
//! ```
//! use mqengine_utils::{to_duration, Counter};
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(to_duration("250ms").as_millis(), 250);
//!
//! let depth = Counter::new();
//! depth.inc();
//! assert_eq!(depth.max(), 1);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::de::{Deserialize, Deserializer};

mod counter;

pub use counter::Counter;

/// Deserialize a [`Duration`] written as a human-readable string.
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Convert a human-readable duration string into a [`Duration`].
///
/// Units: `ms`, `s`, `m`, `h`, `d`. Unknown or malformed components count as zero.
///
/// ```
/// assert_eq!(mqengine_utils::to_duration("2s500ms").as_millis(), 2500);
/// assert_eq!(mqengine_utils::to_duration("bogus").as_millis(), 0);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    // "ms" is folded into a single marker so that 'm' stays minutes.
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'Y'])
        .map(|part| {
            let mut chars = part.chars();
            let unit = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_) => return 0,
                Ok(v) => v,
            };
            match unit {
                'Y' => v,
                's' => v * 1_000,
                'm' => v * 60_000,
                'h' => v * 3_600_000,
                'd' => v * 86_400_000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}
