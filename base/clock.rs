// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Everything that sleeps, waits with a deadline, or measures elapsed wall
//! time goes through [`Clocks`], so timing behavior can be driven
//! deterministically from tests via [`SimulatedClocks`].

use crate::time::Duration;
use crate::{Condvar, Mutex};
use std::fmt;
use std::ops;
use std::sync::Arc;

/// A point on the local monotonic clock, in microseconds since an arbitrary
/// origin (typically boot).
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Instant(pub i64);

impl ops::Sub for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs.0)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", Duration(self.0))
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Clone + Send + Sync + 'static {
    /// Gets the current time from a monotonic clock.
    fn monotonic(&self) -> Instant;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);

    /// Waits on `cv` until notified or until `deadline` on this clock.
    ///
    /// May return early (spurious wakeups, notifications); callers re-check
    /// their predicate and deadline in a loop.
    fn wait_until<'a, T>(
        &self,
        cv: &Condvar,
        guard: std::sync::MutexGuard<'a, T>,
        deadline: Instant,
    ) -> std::sync::MutexGuard<'a, T>;
}

#[derive(Copy, Clone)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn monotonic(&self) -> Instant {
        match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Instant(ts.tv_sec() as i64 * 1_000_000 + ts.tv_nsec() as i64 / 1_000),
            Err(err) => panic!("clock_gettime(CLOCK_MONOTONIC) failed: {err}"),
        }
    }

    fn sleep(&self, how_long: Duration) {
        match how_long.to_std() {
            Some(d) => std::thread::sleep(d),
            None => tracing::warn!("invalid sleep duration {:?}", how_long),
        }
    }

    fn wait_until<'a, T>(
        &self,
        cv: &Condvar,
        guard: std::sync::MutexGuard<'a, T>,
        deadline: Instant,
    ) -> std::sync::MutexGuard<'a, T> {
        match (deadline - self.monotonic()).to_std() {
            Some(timeout) => cv.wait_timeout(guard, timeout).0,
            None => guard, // deadline already passed
        }
    }
}

/// Simulated clock for testing.
///
/// Sleeps and deadline waits advance the clock instead of blocking, so timed
/// logic runs as fast as the scheduler allows while observing the same
/// instants it would in real time.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new() -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Default for SimulatedClocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocks for SimulatedClocks {
    fn monotonic(&self) -> Instant {
        Instant(self.0.uptime.lock().0)
    }

    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }

    /// Advances the clock to `deadline` and returns without blocking.
    fn wait_until<'a, T>(
        &self,
        _cv: &Condvar,
        guard: std::sync::MutexGuard<'a, T>,
        deadline: Instant,
    ) -> std::sync::MutexGuard<'a, T> {
        let mut l = self.0.uptime.lock();
        if deadline.0 > l.0 {
            *l = Duration(deadline.0);
        }
        guard
    }
}

/// A pausable stopwatch: accumulates elapsed monotonic time while running.
///
/// The caller supplies the current instant to every transition, so the watch
/// itself holds no clock handle and can live inside a mutex-guarded state
/// struct.
pub struct Stopwatch {
    accumulated: Duration,
    resumed_at: Option<Instant>,
}

impl Stopwatch {
    /// A new stopwatch, paused, with nothing accumulated.
    pub fn new() -> Self {
        Stopwatch {
            accumulated: Duration::ZERO,
            resumed_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.resumed_at.is_some()
    }

    pub fn pause(&mut self, now: Instant) {
        if let Some(resumed_at) = self.resumed_at.take() {
            self.accumulated += now - resumed_at;
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if self.resumed_at.is_none() {
            self.resumed_at = Some(now);
        }
    }

    /// Returns the total elapsed running time and restarts from zero,
    /// preserving the running/paused state.
    pub fn lap(&mut self, now: Instant) -> Duration {
        let mut elapsed = self.accumulated;
        self.accumulated = Duration::ZERO;
        if let Some(resumed_at) = &mut self.resumed_at {
            elapsed += now - *resumed_at;
            *resumed_at = now;
        }
        elapsed
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}
