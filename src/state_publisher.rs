// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Publishes status and simulation-time snapshots, every 500 ms and on
//! demand. The two messages go out in a fixed order: state, then sim time.

use crate::engine::Inner;
use crate::json::{self, MeasurementInfoMsg, PlayerStateMsg, SettingsMsg, SimTimeMsg, SimulationState};
use base::clock::Clocks;
use base::{err, Condvar, Error, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

const CYCLE: std::time::Duration = std::time::Duration::from_millis(500);

/// The wakeup surface of the state publisher, shared with the engine.
pub(crate) struct Shared {
    loop_mutex: Mutex<()>,
    loop_cv: Condvar,
    interrupted: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Shared {
            loop_mutex: Mutex::new(()),
            loop_cv: Condvar::new(),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Requests an immediate publish cycle.
    pub(crate) fn publish_now(&self) {
        self.loop_cv.notify_all();
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.loop_cv.notify_all();
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

pub(crate) struct StatePublisherThread {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StatePublisherThread {
    pub(crate) fn spawn<C: Clocks>(
        inner: Arc<Inner<C>>,
        state_publisher: Box<dyn bus::Publisher>,
        sim_time_publisher: Box<dyn bus::Publisher>,
    ) -> Result<Self, Error> {
        let shared = inner.sp.clone();
        let handle = thread::Builder::new()
            .name("state-publisher".to_owned())
            .spawn(move || run(&inner, &*state_publisher, &*sim_time_publisher))
            .map_err(|e| err!(Internal, source(e), msg("cannot spawn state publisher")))?;
        Ok(StatePublisherThread {
            shared,
            handle: Some(handle),
        })
    }
}

impl Drop for StatePublisherThread {
    fn drop(&mut self) {
        self.shared.interrupt();
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("state publisher thread panicked");
            }
        }
    }
}

fn run<C: Clocks>(
    inner: &Inner<C>,
    state_publisher: &dyn bus::Publisher,
    sim_time_publisher: &dyn bus::Publisher,
) {
    let shared = inner.sp.clone();
    let mut guard = shared.loop_mutex.lock();
    while !shared.is_interrupted() {
        // Note this is a real-time cycle even under simulated clocks: the
        // cadence of snapshots must not advance the simulated time.
        (guard, _) = shared.loop_cv.wait_timeout(guard, CYCLE);
        if shared.is_interrupted() {
            return;
        }
        publish(state_publisher, inner, &build_state_message(inner));
        if shared.is_interrupted() {
            return;
        }
        publish(sim_time_publisher, inner, &build_sim_time_message(inner));
    }
}

fn publish<C: Clocks, M: serde::Serialize>(publisher: &dyn bus::Publisher, inner: &Inner<C>, msg: &M) {
    match serde_json::to_vec(msg) {
        Ok(payload) => {
            publisher.send(&payload, inner.current_play_state().sim_time);
        }
        Err(err) => warn!(topic = publisher.topic_name(), %err, "cannot serialize snapshot"),
    }
}

pub(crate) fn build_state_message<C: Clocks>(inner: &Inner<C>) -> PlayerStateMsg {
    let play_state = inner.current_play_state();
    let measurement_loaded = inner.is_measurement_loaded();
    let measurement_info = if measurement_loaded {
        let (first, last) = inner.measurement_boundaries();
        Some(MeasurementInfoMsg {
            path: inner
                .measurement_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            frame_count: inner.frame_count(),
            first_timestamp_nsecs: first.as_nanos(),
            last_timestamp_nsecs: last.as_nanos(),
        })
    } else {
        None
    };
    let limit_interval = inner.limit_interval();
    PlayerStateMsg {
        host_name: json::host_name(),
        process_id: std::process::id(),
        playing: play_state.playing,
        measurement_loaded,
        actual_speed: play_state.actual_play_rate,
        current_measurement_index: play_state.current_frame_index,
        current_measurement_timestamp_nsecs: play_state.current_frame_timestamp.as_nanos(),
        measurement_info,
        settings: SettingsMsg {
            play_speed: inner.play_speed(),
            limit_play_speed: inner.is_limit_play_speed_enabled(),
            repeat_enabled: inner.is_repeat_enabled(),
            framedropping_allowed: inner.is_framedropping_allowed(),
            enforce_delay_accuracy_enabled: inner.is_enforce_delay_accuracy_enabled(),
            limit_interval_lower_index: limit_interval.0,
            limit_interval_upper_index: limit_interval.1,
        },
    }
}

pub(crate) fn build_sim_time_message<C: Clocks>(inner: &Inner<C>) -> SimTimeMsg {
    let play_state = inner.current_play_state();
    let simulation_state = if !inner.is_measurement_loaded() {
        SimulationState::Stopped
    } else if play_state.playing {
        SimulationState::Playing
    } else {
        SimulationState::Paused
    };
    SimTimeMsg {
        simulation_state,
        simulation_time_nsecs: play_state.sim_time.as_nanos(),
        real_time_factor: play_state.sim_time_rate,
        local_time_nsecs: play_state.sim_time_local_timestamp.0.saturating_mul(1_000),
        host_name: json::host_name(),
        process_id: std::process::id(),
    }
}
