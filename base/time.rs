// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time and durations on the measurement timeline.
//!
//! Recordings index their frames in microseconds since the Unix epoch; all
//! in-process arithmetic stays in that unit. Conversion to nanoseconds
//! happens only at the bus-message boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;

pub const MICROS_PER_SEC: i64 = 1_000_000;

/// A measurement timestamp in microseconds since the Unix epoch.
#[derive(
    Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Time(pub i64);

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    /// The same instant in nanoseconds, saturating on overflow.
    pub fn as_nanos(self) -> i64 {
        self.0.saturating_mul(1_000)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_SEC as f64
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sign, t) = if self.0 < 0 { ("-", -self.0) } else { ("", self.0) };
        write!(
            f,
            "{}{}.{:06} s",
            sign,
            t / MICROS_PER_SEC,
            t % MICROS_PER_SEC
        )
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self} ({})", self.0)
    }
}

/// A signed duration in microseconds.
#[derive(
    Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Duration(pub i64);

impl Duration {
    pub const ZERO: Self = Duration(0);

    pub const fn from_secs(secs: i64) -> Self {
        Duration(secs * MICROS_PER_SEC)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Duration(millis * 1_000)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Duration((secs * MICROS_PER_SEC as f64).round() as i64)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_SEC as f64
    }

    pub fn as_nanos(self) -> i64 {
        self.0.saturating_mul(1_000)
    }

    /// Scales by a real factor, rounding to the nearest microsecond.
    pub fn mul_f64(self, factor: f64) -> Self {
        Duration((self.0 as f64 * factor).round() as i64)
    }

    /// Divides by a real factor, rounding to the nearest microsecond.
    pub fn div_f64(self, divisor: f64) -> Self {
        Duration((self.0 as f64 / divisor).round() as i64)
    }

    /// The ratio of two durations.
    pub fn ratio(self, denominator: Duration) -> f64 {
        self.0 as f64 / denominator.0 as f64
    }

    /// Conversion for `std` sleep/wait APIs; `None` for negative durations.
    pub fn to_std(self) -> Option<std::time::Duration> {
        u64::try_from(self.0)
            .ok()
            .map(std::time::Duration::from_micros)
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sign, d) = if self.0 < 0 { ("-", -self.0) } else { ("", self.0) };
        write!(
            f,
            "{}{}.{:06} s",
            sign,
            d / MICROS_PER_SEC,
            d % MICROS_PER_SEC
        )
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::{Duration, Time};

    #[test]
    fn time_arithmetic() {
        let t = Time(1_500_000);
        assert_eq!(t - Time(500_000), Duration::from_secs(1));
        assert_eq!(t + Duration::from_millis(500), Time(2_000_000));
        assert_eq!(t - Duration::from_millis(500), Time(1_000_000));
        assert_eq!(t.as_nanos(), 1_500_000_000);
    }

    #[test]
    fn duration_scaling() {
        assert_eq!(Duration::from_secs(1).mul_f64(0.5), Duration(500_000));
        assert_eq!(Duration::from_secs(1).div_f64(4.0), Duration(250_000));
        assert_eq!(Duration::from_secs_f64(-0.25), Duration(-250_000));
        assert_eq!(Duration::from_secs(3).ratio(Duration::from_secs(2)), 1.5);
    }

    #[test]
    fn std_conversion() {
        assert_eq!(
            Duration::from_millis(1).to_std(),
            Some(std::time::Duration::from_millis(1))
        );
        assert_eq!(Duration(-1).to_std(), None);
    }

    #[test]
    fn display() {
        assert_eq!(Time(1_000_001).to_string(), "1.000001 s");
        assert_eq!(Duration(-1_500_000).to_string(), "-1.500000 s");
    }
}
