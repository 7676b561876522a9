//! Utilities shared by the endpoint runtime
//!
//! ## Core Features:
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Timestamp Utilities**: Millisecond timestamps, seconds/millis conversion and formatting
//! - **Clock**: Injectable wall-clock source ([`Clock`], [`SystemClock`], [`ManualClock`])
//! - **Path Components**: Sanitizing of identifiers used as directory names
//!
//! ## Usage Examples:
//! ```rust
//! use rmqtt_utils::{to_duration, secs_to_millis, Clock, ManualClock};
//!
//! // Duration conversion
//! let duration = to_duration("1h30m15s").unwrap();
//! assert_eq!(duration.as_secs(), 5415);
//!
//! // Wire timestamps are float seconds, internal ones are integer milliseconds
//! assert_eq!(secs_to_millis(1700000000.0), 1_700_000_000_000);
//!
//! // Deterministic clock for tests
//! let clock = ManualClock::new(1_000);
//! clock.advance(500);
//! assert_eq!(clock.now_millis(), 1_500);
//! ```

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::de::{self, Deserialize, Deserializer};

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    to_duration(&v).ok_or_else(|| de::Error::custom(format!("invalid duration {:?}", v)))
}

/// Convert human-readable duration string to Duration
///
/// Every number must carry a unit, `None` is returned for empty text, unit-less
/// numbers and unknown units.
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
/// - w: weeks
/// - f: fortnight (2 weeks)
///
/// # Example:
/// ```
/// let duration = rmqtt_utils::to_duration("1h30m15s").unwrap();
/// assert_eq!(duration.as_secs(), 5415);
///
/// let short = rmqtt_utils::to_duration("250ms").unwrap();
/// assert_eq!(short.as_millis(), 250);
///
/// assert!(rmqtt_utils::to_duration("10").is_none());
/// ```
pub fn to_duration(text: &str) -> Option<Duration> {
    let text = text.trim().to_lowercase().replace("ms", "Y");
    if text.is_empty() {
        return None;
    }
    let mut ms: u64 = 0;
    for x in text.split_inclusive(['s', 'm', 'h', 'd', 'w', 'f', 'Y']) {
        let mut chars = x.chars();
        let u = chars.nth_back(0)?;
        let v = chars.as_str().trim().parse::<u64>().ok()?;
        let unit = match u {
            'Y' => 1,
            's' => 1000,
            'm' => 60000,
            'h' => 3600000,
            'd' => 86400000,
            'w' => 604800000,
            'f' => 1209600000,
            _ => return None,
        };
        ms = ms.checked_add(v.checked_mul(unit)?)?;
    }
    Some(Duration::from_millis(ms))
}

/// Get current timestamp in milliseconds
///
/// # Example:
/// ```
/// let ts = rmqtt_utils::timestamp_millis();
/// assert!(ts > 0);
/// ```
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Format millisecond timestamp to string
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}

/// Convert a millisecond timestamp into float seconds, as carried on the wire
#[inline]
pub fn millis_to_secs(t: TimestampMillis) -> f64 {
    t as f64 / 1000.0
}

/// Convert float seconds into a millisecond timestamp, rounding to the nearest millisecond
///
/// # Example:
/// ```
/// assert_eq!(rmqtt_utils::secs_to_millis(1.2345), 1235);
/// ```
#[inline]
pub fn secs_to_millis(secs: f64) -> TimestampMillis {
    (secs * 1000.0).round() as TimestampMillis
}

/// Source of wall-clock time in milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> TimestampMillis;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_millis(&self) -> TimestampMillis {
        timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    #[inline]
    pub fn new(now: TimestampMillis) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    #[inline]
    pub fn set(&self, now: TimestampMillis) {
        self.now.store(now, Ordering::SeqCst);
    }

    #[inline]
    pub fn advance(&self, millis: TimestampMillis) -> TimestampMillis {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_millis(&self) -> TimestampMillis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Strip characters that are not safe inside a single directory name
///
/// # Example:
/// ```
/// let dir = rmqtt_utils::sanitize_path_component("dev-1-endpoint--tcp://broker:1883");
/// assert_eq!(dir, "dev-1-endpoint--tcpbroker1883");
/// ```
#[inline]
pub fn sanitize_path_component(text: &str) -> String {
    text.chars().filter(|c| !matches!(c, '/' | '\\' | ':' | ' ')).collect()
}
