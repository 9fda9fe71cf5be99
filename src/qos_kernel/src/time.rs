//! Timeout values
use core::{fmt, time::Duration};

/// A signed microsecond value that encodes how long a blocking operation may
/// wait.
///
/// | raw value      | meaning                                        |
/// | -------------- | ---------------------------------------------- |
/// | `-1`           | wait forever ([`NO_TIMEOUT`](Self::NO_TIMEOUT)) |
/// | `0`            | don't block ([`NO_BLOCKING`](Self::NO_BLOCKING)) |
/// | `1`            | until the next tick ([`NEXT_TICK`](Self::NEXT_TICK)) |
/// | `> 1`          | a duration in microseconds                      |
/// | `< -1`         | an absolute time, `i64::MIN + µs since boot`    |
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeValue(i64);

/// The absolute deadline a [`TimeValue`] resolves to at the time of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Fail immediately instead of blocking.
    Poll,
    /// Wait until woken.
    Forever,
    /// Wait until the given time (µs since boot) has been reached by a tick.
    At(u64),
}

impl TimeValue {
    pub const NO_TIMEOUT: Self = Self(-1);
    pub const NO_BLOCKING: Self = Self(0);
    pub const NEXT_TICK: Self = Self(1);

    /// The largest representable absolute time.
    const MAX_ABSOLUTE_US: u64 = i64::MAX as u64 - 1;

    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> i64 {
        self.0
    }

    /// Construct a relative timeout. `0` and `1` collapse into
    /// [`NO_BLOCKING`](Self::NO_BLOCKING) and [`NEXT_TICK`](Self::NEXT_TICK).
    pub const fn from_micros(us: u64) -> Self {
        if us > i64::MAX as u64 {
            Self(i64::MAX)
        } else {
            Self(us as i64)
        }
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self::from_micros(ms.saturating_mul(1_000))
    }

    /// Construct an absolute timeout expiring at `us` microseconds since
    /// boot.
    pub const fn at(us: u64) -> Self {
        let us = if us > Self::MAX_ABSOLUTE_US {
            Self::MAX_ABSOLUTE_US
        } else {
            us
        };
        Self(i64::MIN + us as i64)
    }

    #[inline]
    pub const fn is_absolute(self) -> bool {
        self.0 < -1
    }

    /// Resolve the value into a deadline, given the current time `now`.
    pub fn to_deadline(self, now: u64) -> Deadline {
        match self.0 {
            -1 => Deadline::Forever,
            0 => Deadline::Poll,
            // Expires on the first tick observed after `now`
            1 => Deadline::At(now),
            x if x > 1 => Deadline::At(now.saturating_add(x as u64)),
            x => Deadline::At(x.wrapping_sub(i64::MIN) as u64),
        }
    }
}

impl From<Duration> for TimeValue {
    fn from(x: Duration) -> Self {
        Self::from_micros(u64::try_from(x.as_micros()).unwrap_or(u64::MAX))
    }
}

impl fmt::Debug for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            -1 => f.write_str("NO_TIMEOUT"),
            0 => f.write_str("NO_BLOCKING"),
            1 => f.write_str("NEXT_TICK"),
            x if x > 1 => write!(f, "{}µs", x),
            x => write!(f, "at({}µs)", x.wrapping_sub(i64::MIN)),
        }
    }
}
