// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The single mutable coordination object of the player.

use base::clock::{Instant, Stopwatch};
use base::time::{Duration, Time};
use std::collections::VecDeque;

/// Playback position, settings, and the simulation-time anchor.
///
/// Guarded by the engine's command mutex; every mutation that could affect a
/// blocked wait must notify the pause condvar.
#[derive(Clone, Debug)]
pub(crate) struct PlayCommand {
    /// Whether the playback is currently running.
    pub playing: bool,
    /// The target relative rate. Not respected if `limit_play_speed` is off.
    pub play_speed: f64,
    /// When false, publish as fast as possible; `play_speed`,
    /// `framedropping_allowed` and `enforce_delay_accuracy` are ignored.
    pub limit_play_speed: bool,
    /// Restart from the front of the limit interval at the end.
    pub repeat_enabled: bool,
    /// Skip overdue frames to keep the remaining ones on time.
    pub framedropping_allowed: bool,
    /// Always honor the inter-frame gap, even after a late frame.
    pub enforce_delay_accuracy: bool,
    /// Pause upon reaching this index; < 0 means play to the end.
    pub play_until_index: i64,

    /// The `[lo, hi]` frame-index range playback is confined to.
    pub limit_interval: (i64, i64),
    /// Timestamps of the limit interval bounds, cached so the measurement
    /// lock is not needed to consult them.
    pub limit_interval_times: (Time, Time),

    /// Set by seeks and limit changes so the post-publish bookkeeping does
    /// not clobber the manually chosen position.
    pub next_frame_set_manually: bool,
    pub next_frame_index: i64,
    pub next_frame_timestamp: Time,

    /// The last frame that was published, or the frame that will be
    /// published next right after a jump.
    pub current_frame_index: i64,
    pub current_frame_timestamp: Time,

    /// Cached measurement bounds, for the same lock-avoidance reason as the
    /// limit interval times.
    pub first_measurement_timestamp: Time,
    pub last_measurement_timestamp: Time,

    /// Anchor pair: `sim_time` was the valid simulated clock at local
    /// monotonic time `sim_time_local_timestamp`; the current simulated
    /// time is interpolated at rate `play_speed`.
    pub sim_time: Time,
    pub sim_time_local_timestamp: Instant,
}

impl Default for PlayCommand {
    fn default() -> Self {
        PlayCommand {
            playing: false,
            play_speed: 1.0,
            limit_play_speed: true,
            repeat_enabled: false,
            framedropping_allowed: false,
            enforce_delay_accuracy: false,
            play_until_index: -1,
            limit_interval: (0, 0),
            limit_interval_times: (Time(0), Time(0)),
            next_frame_set_manually: false,
            next_frame_index: -1,
            next_frame_timestamp: Time(0),
            current_frame_index: -1,
            current_frame_timestamp: Time(0),
            first_measurement_timestamp: Time(0),
            last_measurement_timestamp: Time(0),
            sim_time: Time(0),
            sim_time_local_timestamp: Instant(0),
        }
    }
}

/// Everything behind the command mutex: the command itself, the wall-time
/// log used to compute the observed play rate, and the inter-frame
/// stopwatch.
pub(crate) struct CommandState {
    pub command: PlayCommand,
    /// `(sim time of published frame, wall duration to publish it)`,
    /// bounded to roughly the last second of wall time.
    pub time_log: VecDeque<(Time, Duration)>,
    /// Running sum of the wall durations in `time_log`.
    pub time_log_span: Duration,
    /// Measures wall time between frames; paused whenever playback is.
    pub stopwatch: Stopwatch,
}

impl CommandState {
    pub fn new() -> Self {
        CommandState {
            command: PlayCommand::default(),
            time_log: VecDeque::new(),
            time_log_span: Duration::ZERO,
            stopwatch: Stopwatch::new(),
        }
    }

    pub fn clear_time_log(&mut self) {
        self.time_log.clear();
        self.time_log_span = Duration::ZERO;
    }
}
