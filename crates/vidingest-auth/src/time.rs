//! Absolute time in 100-nanosecond units.
//!
//! Every expiration in the credential layer is an absolute instant counted in
//! hundreds of nanoseconds since the Unix epoch. Time is always read through a
//! [`Clock`] so hosts and tests can substitute their own source.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Timestamp units per second.
pub const HUNDREDS_OF_NANOS_IN_A_SECOND: u64 = 10_000_000;
const NANOS_IN_A_HUNDRED_NANOS: u64 = 100;

/// An absolute instant, in 100 ns units since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Instant from a raw count of 100 ns units.
    pub const fn from_hundreds_of_nanos(value: u64) -> Self {
        Timestamp(value)
    }

    /// Instant from whole Unix seconds, saturating.
    pub const fn from_unix_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(HUNDREDS_OF_NANOS_IN_A_SECOND))
    }

    /// Raw count of 100 ns units.
    pub const fn as_hundreds_of_nanos(self) -> u64 {
        self.0
    }

    /// Whole seconds since the epoch, truncating.
    pub const fn as_unix_secs(self) -> u64 {
        self.0 / HUNDREDS_OF_NANOS_IN_A_SECOND
    }

    /// `self + duration`, clamped at the largest instant.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration_to_units(duration)))
    }

    /// `self - duration`, clamped at the epoch.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration_to_units(duration)))
    }

    /// Time elapsed from `earlier` to `self`; zero if `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        units_to_duration(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / HUNDREDS_OF_NANOS_IN_A_SECOND;
        let frac = self.0 % HUNDREDS_OF_NANOS_IN_A_SECOND;
        write!(f, "{}.{:07}", secs, frac)
    }
}

/// Convert a duration to 100 ns units, saturating.
pub fn duration_to_units(duration: Duration) -> u64 {
    let units = duration.as_nanos() / u128::from(NANOS_IN_A_HUNDRED_NANOS);
    u64::try_from(units).unwrap_or(u64::MAX)
}

/// Convert 100 ns units to a duration.
pub fn units_to_duration(units: u64) -> Duration {
    Duration::from_nanos(units.saturating_mul(NANOS_IN_A_HUNDRED_NANOS))
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration_to_units(elapsed))
    }
}

/// A clock that only moves when told to. Used for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Clock reading `start` until moved.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start.as_hundreds_of_nanos()),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now.as_hundreds_of_nanos(), Ordering::SeqCst);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_to_units(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }
}
