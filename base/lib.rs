// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod clock;
mod error;
pub mod time;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};

pub type FastHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// [`std::sync::Mutex`] wrapper that is never poisoned.
///
/// This is the same API as `parking_lot::Mutex`, which is probably more
/// efficient, but this allows easy switching.
#[derive(Default)]
pub struct Mutex<T>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self(std::sync::Mutex::new(value))
    }

    #[track_caller]
    pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[track_caller]
    pub fn into_inner(self) -> T {
        self.0
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// [`std::sync::RwLock`] wrapper that is never poisoned.
#[derive(Default)]
pub struct RwLock<T>(std::sync::RwLock<T>);

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self(std::sync::RwLock::new(value))
    }

    #[track_caller]
    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[track_caller]
    pub fn write(&self) -> std::sync::RwLockWriteGuard<'_, T> {
        self.0
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// [`std::sync::Condvar`] wrapper that never sees poison.
#[derive(Default)]
pub struct Condvar(std::sync::Condvar);

impl Condvar {
    pub fn new() -> Self {
        Self(std::sync::Condvar::new())
    }

    #[track_caller]
    pub fn notify_all(&self) {
        self.0.notify_all()
    }

    #[track_caller]
    pub fn notify_one(&self) {
        self.0.notify_one()
    }

    #[track_caller]
    pub fn wait<'a, T>(&self, guard: std::sync::MutexGuard<'a, T>) -> std::sync::MutexGuard<'a, T> {
        self.0
            .wait(guard)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[track_caller]
    pub fn wait_while<'a, T, F: FnMut(&mut T) -> bool>(
        &self,
        guard: std::sync::MutexGuard<'a, T>,
        condition: F,
    ) -> std::sync::MutexGuard<'a, T> {
        self.0
            .wait_while(guard, condition)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[track_caller]
    pub fn wait_timeout<'a, T>(
        &self,
        guard: std::sync::MutexGuard<'a, T>,
        timeout: std::time::Duration,
    ) -> (std::sync::MutexGuard<'a, T>, std::sync::WaitTimeoutResult) {
        self.0
            .wait_timeout(guard, timeout)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[track_caller]
    pub fn wait_timeout_while<'a, T, F: FnMut(&mut T) -> bool>(
        &self,
        guard: std::sync::MutexGuard<'a, T>,
        timeout: std::time::Duration,
        condition: F,
    ) -> (std::sync::MutexGuard<'a, T>, std::sync::WaitTimeoutResult) {
        self.0
            .wait_timeout_while(guard, timeout, condition)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
