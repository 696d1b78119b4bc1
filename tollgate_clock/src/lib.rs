//! Utilities for messing with time
//!
//! Times are tracked with millisecond resolution so that short-lived
//! credentials and sub-second safety margins can be represented exactly.
//! The [`Clock`] trait allows the current time to be swapped out, and
//! [`TestClock`] provides a shareable, manually-advanced clock for tests.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time
///
/// Unix time as represented by the number of milliseconds elapsed since the
/// beginning of the Unix epoch on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct UnixTime(pub u64);

impl From<SystemTime> for UnixTime {
    /// Times before the Unix epoch collapse to the epoch itself
    #[inline]
    fn from(t: SystemTime) -> Self {
        let millis = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or_default();

        UnixTime(millis)
    }
}

/// A span of time with millisecond resolution
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct DurationMillis(pub u64);

impl DurationMillis {
    /// A zero-length duration
    pub const ZERO: Self = Self(0);

    /// Constructs a duration from a whole number of seconds
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Constructs a duration from a number of milliseconds
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The number of whole seconds in this duration
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    /// Subtracts `rhs`, stopping at zero
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<DurationMillis> for Duration {
    #[inline]
    fn from(d: DurationMillis) -> Self {
        Duration::from_millis(d.0)
    }
}

impl From<Duration> for DurationMillis {
    #[inline]
    fn from(d: Duration) -> Self {
        Self(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }
}

impl ops::Add<DurationMillis> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        UnixTime(self.0.saturating_add(rhs.0))
    }
}

impl ops::AddAssign<DurationMillis> for UnixTime {
    #[inline]
    fn add_assign(&mut self, rhs: DurationMillis) {
        *self = *self + rhs;
    }
}

impl ops::Sub<DurationMillis> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: DurationMillis) -> Self::Output {
        UnixTime(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Sub<UnixTime> for UnixTime {
    type Output = DurationMillis;

    /// The time elapsed from `rhs` to `self`, or zero if `rhs` is later
    #[inline]
    fn sub(self, rhs: UnixTime) -> Self::Output {
        DurationMillis(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Add for DurationMillis {
    type Output = DurationMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        DurationMillis(self.0.saturating_add(rhs.0))
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for UnixTime {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for UnixTime {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTime;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime::from(SystemTime::now())
    }
}

/// A test clock which maintains the current time as shared internal state
///
/// Clones share the same underlying time, so a test can keep one handle
/// and advance it while another handle is owned by the code under test.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime(self.0.load(Ordering::Acquire))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    #[inline]
    pub fn new(time: UnixTime) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixTime) {
        self.0.store(val.0, Ordering::Release);
    }

    /// Moves the clock's current time forward by `inc`
    pub fn advance(&self, inc: DurationMillis) {
        self.0.fetch_add(inc.0, Ordering::AcqRel);
    }
}
