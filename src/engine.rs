// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The playback engine: a worker thread that realizes the timing policy
//! under concurrent external commands.
//!
//! One iteration of the worker loop publishes one frame, in three phases:
//! wait (command mutex held, sleeping on the pause condvar until the frame
//! is due), publish (measurement lock held shared, command mutex released),
//! and commit (command mutex again, merging results back unless an external
//! command repositioned the player meanwhile). The command mutex and the
//! measurement lock are never held at the same time.

use crate::command::{CommandState, PlayCommand};
use crate::state_publisher::{self, StatePublisherThread};
use base::clock::{Clocks, Instant};
use base::time::{Duration, Time};
use base::{err, Condvar, Error, Mutex, RwLock};
use meas::MeasurementContainer;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// A snapshot of the player's externally visible state.
///
/// The sim time anchor is not updated continuously; to perceive a current
/// simulation time, interpolate from the anchor at `sim_time_rate`.
#[derive(Clone, Copy, Debug)]
pub struct PlayState {
    pub playing: bool,
    /// Observed play rate; may differ from the configured one.
    pub actual_play_rate: f64,
    pub current_frame_index: i64,
    pub current_frame_timestamp: Time,
    pub sim_time: Time,
    pub sim_time_local_timestamp: Instant,
    pub sim_time_rate: f64,
}

/// Owns the player worker thread and the state publisher thread.
///
/// Dropping the engine interrupts and joins both.
pub struct Engine<C: Clocks> {
    inner: Arc<Inner<C>>,
    play_thread: Option<thread::JoinHandle<()>>,
    state_publisher: Option<StatePublisherThread>,
}

impl<C: Clocks> Engine<C> {
    pub fn new(bus: Arc<dyn bus::Bus>, clocks: C) -> Result<Self, Error> {
        let snapshot_info = bus::DataTypeInfo {
            name: "tapedeck snapshot".to_owned(),
            encoding: "json".to_owned(),
            descriptor: Vec::new(),
        };
        let state_publisher_handle = bus.create_publisher(crate::json::STATE_TOPIC, &snapshot_info)?;
        let sim_time_publisher_handle =
            bus.create_publisher(crate::json::SIM_TIME_TOPIC, &snapshot_info)?;
        let sp = Arc::new(state_publisher::Shared::new());
        let inner = Arc::new(Inner {
            clocks,
            bus,
            command: Mutex::new(CommandState::new()),
            pause_cv: Condvar::new(),
            measurement: RwLock::new(None),
            interrupted: AtomicBool::new(false),
            sp,
        });
        let state_publisher = StatePublisherThread::spawn(
            inner.clone(),
            state_publisher_handle,
            sim_time_publisher_handle,
        )?;
        let play_inner = inner.clone();
        let play_thread = thread::Builder::new()
            .name("player".to_owned())
            .spawn(move || play_inner.run())
            .map_err(|e| err!(Internal, source(e), msg("cannot spawn player thread")))?;
        Ok(Engine {
            inner,
            play_thread: Some(play_thread),
            state_publisher: Some(state_publisher),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<Inner<C>> {
        &self.inner
    }
}

impl<C: Clocks> Drop for Engine<C> {
    fn drop(&mut self) {
        self.inner.interrupt();
        if let Some(h) = self.play_thread.take() {
            if h.join().is_err() {
                warn!("player thread panicked");
            }
        }
        // Joins the state publisher.
        self.state_publisher.take();
    }
}

pub(crate) struct Inner<C: Clocks> {
    pub(crate) clocks: C,
    bus: Arc<dyn bus::Bus>,
    command: Mutex<CommandState>,
    pause_cv: Condvar,
    measurement: RwLock<Option<MeasurementContainer>>,
    interrupted: AtomicBool,
    pub(crate) sp: Arc<state_publisher::Shared>,
}

/// The simulated clock as of `now`, interpolated from the anchor while
/// playing.
fn interpolated_sim_time(cmd: &PlayCommand, now: Instant) -> Time {
    if cmd.playing {
        cmd.sim_time + (now - cmd.sim_time_local_timestamp).mul_f64(cmd.play_speed)
    } else {
        cmd.sim_time
    }
}

/// Re-anchors the simulated clock to `sim_time` as of `now`.
fn anchor_sim_time(cmd: &mut PlayCommand, sim_time: Time, now: Instant) {
    cmd.sim_time = sim_time;
    cmd.sim_time_local_timestamp = now;
}

/// The local monotonic instant at which the simulated clock reaches
/// `sim_ts`, or `None` ("the end of times") at rate 0.
fn system_time_for(cmd: &PlayCommand, sim_ts: Time) -> Option<Instant> {
    if cmd.play_speed.abs() < f64::EPSILON {
        return None;
    }
    Some(cmd.sim_time_local_timestamp + (sim_ts - cmd.sim_time).div_f64(cmd.play_speed))
}

/// The observed rate over the time log, or the configured rate when the
/// log is too short. Keeps returning the pre-pause value while paused.
fn observed_play_speed(state: &CommandState) -> f64 {
    if state.time_log.len() < 2 {
        return state.command.play_speed;
    }
    let mut elapsed_sim = Duration::ZERO;
    let mut elapsed_wall = Duration::ZERO;
    for i in 1..state.time_log.len() {
        elapsed_sim += state.time_log[i].0 - state.time_log[i - 1].0;
        elapsed_wall += state.time_log[i].1;
    }
    elapsed_sim.ratio(elapsed_wall)
}

impl<C: Clocks> Inner<C> {
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.pause_cv.notify_all();
        self.sp.interrupt();
    }

    // The worker loop

    fn run(self: Arc<Self>) {
        while !self.is_interrupted() {
            // Wait phase: hold the command mutex until the next frame is
            // due, then snapshot the command.
            let mut local;
            {
                let mut state = self.command.lock();
                loop {
                    if self.is_interrupted() {
                        return;
                    }
                    if !state.command.playing {
                        state = self.pause_cv.wait_while(state, |s| {
                            !s.command.playing && !self.is_interrupted()
                        });
                        if self.is_interrupted() {
                            return;
                        }
                    }
                    if state.command.playing {
                        if state.command.limit_play_speed {
                            if state.command.enforce_delay_accuracy {
                                // The previous frame ran over; make the next
                                // deadline immediate instead of dropping.
                                let now = self.clocks.monotonic();
                                let current = interpolated_sim_time(&state.command, now);
                                if current - Duration::from_millis(1)
                                    > state.command.next_frame_timestamp
                                {
                                    let t = state.command.next_frame_timestamp;
                                    anchor_sim_time(&mut state.command, t, now);
                                }
                            }
                            // The play rate or the target frame may change
                            // while sleeping, so the deadline is recomputed
                            // on every wakeup rather than baked into a
                            // condvar predicate.
                            loop {
                                if !(state.command.playing && state.command.limit_play_speed) {
                                    break;
                                }
                                match system_time_for(
                                    &state.command,
                                    state.command.next_frame_timestamp,
                                ) {
                                    None => state = self.pause_cv.wait(state),
                                    Some(deadline) => {
                                        if self.clocks.monotonic() >= deadline {
                                            break;
                                        }
                                        state = self.clocks.wait_until(
                                            &self.pause_cv,
                                            state,
                                            deadline,
                                        );
                                    }
                                }
                                if self.is_interrupted() {
                                    return;
                                }
                            }
                            if self.is_interrupted() {
                                return;
                            }
                        }
                        if !state.command.limit_play_speed {
                            // Unlimited rate: no sleeping, just step the
                            // simulated clock to the frame being published.
                            let now = self.clocks.monotonic();
                            let t = state.command.next_frame_timestamp;
                            anchor_sim_time(&mut state.command, t, now);
                        }
                    }
                    if state.command.playing {
                        break;
                    }
                }

                // Snapshot and execute without blocking further commands;
                // publishing may take a while.
                state.command.next_frame_set_manually = false;
                local = state.command.clone();
            }

            // Publish phase: measurement lock held shared, command mutex
            // released.
            let mut published: Option<(Time, Instant)> = None;
            {
                let measurement = self.measurement.read();
                if self.is_interrupted() {
                    return;
                }
                if let Some(container) = &*measurement {
                    container.publish_frame(local.next_frame_index);
                    published = Some((local.next_frame_timestamp, self.clocks.monotonic()));

                    // Tentative next frame; with frame dropping, skip ahead
                    // past frames that are already late.
                    let mut next = local.next_frame_index;
                    loop {
                        next = container.next_enabled_index(
                            next,
                            local.repeat_enabled,
                            local.limit_interval,
                        );
                        let drop_candidate = local.framedropping_allowed
                            && local.limit_play_speed
                            && next > local.next_frame_index
                            && next > 0
                            && container.timestamp(next)
                                < interpolated_sim_time(&local, self.clocks.monotonic());
                        if !drop_candidate {
                            break;
                        }
                    }

                    if next < 0 {
                        // Nothing left to play: pause and rewind to the
                        // front of the limit interval.
                        let zero_index = std::cmp::max(0, local.limit_interval.0);
                        local.playing = false;
                        local.current_frame_index = zero_index;
                        local.current_frame_timestamp = container.timestamp(zero_index);
                        local.next_frame_index = zero_index;
                        local.next_frame_timestamp = container.timestamp(zero_index);
                    } else {
                        if local.play_until_index >= 0 {
                            let last_index = local.next_frame_index;
                            let until_index = local.play_until_index;
                            if (last_index <= until_index && next > until_index) // passed it
                                || (last_index <= until_index && next < last_index)
                            // wrapped
                            {
                                local.playing = false;
                            }
                        }
                        local.current_frame_index = local.next_frame_index;
                        local.current_frame_timestamp = local.next_frame_timestamp;
                        local.next_frame_index = next;
                        local.next_frame_timestamp = container.timestamp(next);
                    }
                }
            }

            // Commit phase: merge the executed command back, unless an
            // external command repositioned the player while we published.
            {
                let mut state = self.command.lock();
                let mut publish_state = false;

                if let Some((sim_ts, lap_now)) = published {
                    let wall = state.stopwatch.lap(lap_now);
                    state.time_log.push_back((sim_ts, wall));
                    state.time_log_span += wall;
                }

                if !state.command.next_frame_set_manually {
                    if local.next_frame_index < state.command.next_frame_index {
                        // Jumped backwards, i.e. looped.
                        state.clear_time_log();
                    }
                    if !local.playing {
                        let now = self.clocks.monotonic();
                        state.stopwatch.pause(now);
                        state.command.playing = false;
                        state.command.current_frame_index = local.current_frame_index;
                        state.command.current_frame_timestamp = local.current_frame_timestamp;
                        state.command.next_frame_index = local.next_frame_index;
                        state.command.next_frame_timestamp = local.next_frame_timestamp;
                        let t = state.command.current_frame_timestamp;
                        anchor_sim_time(&mut state.command, t, now);
                        publish_state = true;
                    } else {
                        if local.next_frame_index < state.command.next_frame_index {
                            let now = self.clocks.monotonic();
                            let t = state.command.limit_interval_times.0;
                            anchor_sim_time(&mut state.command, t, now);
                            publish_state = true;
                        }
                        state.command.current_frame_index = local.current_frame_index;
                        state.command.current_frame_timestamp = local.current_frame_timestamp;
                        state.command.next_frame_index = local.next_frame_index;
                        state.command.next_frame_timestamp = local.next_frame_timestamp;
                    }
                }

                // Keep roughly one second of wall time in the log.
                while state.time_log.len() > 2
                    && state.time_log_span - state.time_log.front().map(|e| e.1).unwrap_or_default()
                        >= Duration::from_secs(1)
                {
                    if let Some((_, wall)) = state.time_log.pop_front() {
                        state.time_log_span -= wall;
                    }
                }

                if publish_state {
                    self.sp.publish_now();
                }
                if !local.playing {
                    info!("playback finished");
                }
            }
        }
    }

    // Playing / pausing / stepping / seeking

    /// Transition helper; call with the command mutex held. Handles the
    /// stopwatch and the sim time anchor on edges and requests an immediate
    /// state publish.
    fn set_playing(&self, state: &mut CommandState, playing: bool) {
        let now = self.clocks.monotonic();
        if state.command.playing && !playing {
            state.stopwatch.pause(now);
            let current = interpolated_sim_time(&state.command, now);
            anchor_sim_time(&mut state.command, current, now);
            info!("playback pause");
        } else if !state.command.playing && playing {
            state.stopwatch.resume(now);
            // No simulated time has elapsed; the anchor resumes from now.
            state.command.sim_time_local_timestamp = now;
            info!("playback start");
        }
        state.command.playing = playing;
        self.sp.publish_now();
    }

    /// Starts the playback. Initializes publishers with recorded names if
    /// the caller has not initialized them already. Pauses again upon
    /// reaching `until_index` (pass a negative index to play to the end).
    pub(crate) fn play(&self, until_index: i64) -> bool {
        {
            let mut measurement = self.measurement.write();
            let Some(container) = measurement.as_mut() else {
                return false;
            };
            if !container.publishers_created() {
                if let Err(err) = container.create_publishers(&*self.bus) {
                    warn!(err = %err.chain(), "cannot initialize publishers");
                    return false;
                }
            }
        }
        let mut state = self.command.lock();
        state.command.play_until_index = until_index;
        self.set_playing(&mut state, true);
        self.pause_cv.notify_all();
        true
    }

    /// Plays from the current position until the given channel's next
    /// occurrence (searching from `current`, publishing from `next`).
    pub(crate) fn play_to_next_occurrence(&self, source_channel_name: &str) -> bool {
        let (current_index, repeat_enabled, limit_interval) = {
            let state = self.command.lock();
            (
                state.command.current_frame_index,
                state.command.repeat_enabled,
                state.command.limit_interval,
            )
        };
        let until_index = {
            let mut measurement = self.measurement.write();
            let Some(container) = measurement.as_mut() else {
                return false;
            };
            if !container.publishers_created() {
                if let Err(err) = container.create_publishers(&*self.bus) {
                    warn!(err = %err.chain(), "cannot initialize publishers");
                    return false;
                }
            }
            container.next_occurrence_of_channel(
                current_index,
                source_channel_name,
                repeat_enabled,
                limit_interval,
            )
        };
        info!("playing to next occurrence of channel {source_channel_name:?}");
        let mut state = self.command.lock();
        state.command.play_until_index = until_index;
        self.set_playing(&mut state, true);
        self.pause_cv.notify_all();
        true
    }

    pub(crate) fn pause(&self) -> bool {
        let mut state = self.command.lock();
        self.set_playing(&mut state, false);
        self.pause_cv.notify_all();
        true
    }

    /// Pauses, then publishes exactly one frame and advances the position.
    /// Stepping always wraps at the end of the limit interval.
    pub(crate) fn step_forward(&self) -> bool {
        let mut local = {
            let mut state = self.command.lock();
            self.set_playing(&mut state, false);
            state.command.clone()
        };
        {
            let mut measurement = self.measurement.write();
            let Some(container) = measurement.as_mut() else {
                return false;
            };
            if !container.publishers_created() {
                if let Err(err) = container.create_publishers(&*self.bus) {
                    warn!(err = %err.chain(), "cannot initialize publishers");
                    return false;
                }
            }
            container.publish_frame(local.next_frame_index);
            let next =
                container.next_enabled_index(local.next_frame_index, true, local.limit_interval);
            local.current_frame_index = local.next_frame_index;
            local.current_frame_timestamp = local.next_frame_timestamp;
            local.next_frame_index = next;
            local.next_frame_timestamp = container.timestamp(next);
        }
        {
            let mut state = self.command.lock();
            // The simulated clock steps to the frame just published (still
            // recorded in the shared state's next frame).
            let now = self.clocks.monotonic();
            let t = state.command.next_frame_timestamp;
            anchor_sim_time(&mut state.command, t, now);

            state.command.playing = false;
            state.command.current_frame_index = local.current_frame_index;
            state.command.current_frame_timestamp = local.current_frame_timestamp;
            state.command.next_frame_index = local.next_frame_index;
            state.command.next_frame_timestamp = local.next_frame_timestamp;
            state.command.next_frame_set_manually = true;
            state.clear_time_log();
        }
        self.sp.publish_now();
        info!("playback step");
        true
    }

    pub(crate) fn jump_to_index(&self, index: i64) -> bool {
        let limit_interval = self.command.lock().command.limit_interval;
        let (index, timestamp) = {
            let measurement = self.measurement.read();
            let Some(container) = measurement.as_ref() else {
                return false;
            };
            let index = index
                .clamp(0, std::cmp::max(0, container.frame_count() - 1))
                .clamp(limit_interval.0, limit_interval.1);
            (index, container.timestamp(index))
        };
        info!("jumping to frame index {index}");
        self.seek_commit(index, timestamp);
        true
    }

    pub(crate) fn jump_to_timestamp(&self, timestamp: Time) -> bool {
        let limit_interval = self.command.lock().command.limit_interval;
        let (index, timestamp) = {
            let measurement = self.measurement.read();
            let Some(container) = measurement.as_ref() else {
                return false;
            };
            let index = container
                .nearest_index(timestamp)
                .clamp(limit_interval.0, limit_interval.1);
            (index, container.timestamp(index))
        };
        info!("jumping to timestamp {timestamp}");
        self.seek_commit(index, timestamp);
        true
    }

    fn seek_commit(&self, index: i64, timestamp: Time) {
        let mut state = self.command.lock();
        state.command.current_frame_index = index;
        state.command.current_frame_timestamp = timestamp;
        state.command.next_frame_index = index;
        state.command.next_frame_timestamp = timestamp;
        state.command.next_frame_set_manually = true;
        let now = self.clocks.monotonic();
        anchor_sim_time(&mut state.command, timestamp, now);
        state.clear_time_log();
        self.pause_cv.notify_all();
        drop(state);
        self.sp.publish_now();
    }

    // Limit interval

    pub(crate) fn set_limit_interval_by_indices(&self, interval: (i64, i64)) -> bool {
        self.set_limit_interval(Some(interval), None)
    }

    pub(crate) fn set_limit_interval_by_timestamps(&self, interval: (Time, Time)) -> bool {
        self.set_limit_interval(None, Some(interval))
    }

    fn set_limit_interval(
        &self,
        indices: Option<(i64, i64)>,
        timestamps: Option<(Time, Time)>,
    ) -> bool {
        let (lower_index, upper_index, lower_time, upper_time) = {
            let measurement = self.measurement.read();
            let Some(container) = measurement.as_ref() else {
                return false;
            };
            if container.frame_count() == 0 {
                return false;
            }
            let (lower, upper) = match (indices, timestamps) {
                (Some((a, b)), _) => (std::cmp::min(a, b), std::cmp::max(a, b)),
                (None, Some((a, b))) => {
                    let (first, second) = if a < b { (a, b) } else { (b, a) };
                    (
                        container.nearest_index(first),
                        container.nearest_index(second),
                    )
                }
                (None, None) => return false,
            };
            let last = container.frame_count() - 1;
            let lower = lower.clamp(0, last);
            let upper = upper.clamp(0, last);
            (
                lower,
                upper,
                container.timestamp(lower),
                container.timestamp(upper),
            )
        };

        info!("setting limit interval to indexes [{lower_index}, {upper_index}]");
        let mut state = self.command.lock();
        state.command.limit_interval = (lower_index, upper_index);
        state.command.limit_interval_times = (lower_time, upper_time);

        // Only reposition if the current position fell outside.
        let cmd = &state.command;
        let (target, target_time) = if cmd.current_frame_index < lower_index
            || cmd.next_frame_index < lower_index
        {
            (lower_index, lower_time)
        } else if cmd.current_frame_index > upper_index || cmd.next_frame_index > upper_index {
            (upper_index, upper_time)
        } else {
            return true;
        };
        state.command.current_frame_index = target;
        state.command.current_frame_timestamp = target_time;
        state.command.next_frame_index = target;
        state.command.next_frame_timestamp = target_time;
        state.command.next_frame_set_manually = true;
        let now = self.clocks.monotonic();
        anchor_sim_time(&mut state.command, target_time, now);
        self.pause_cv.notify_all();
        true
    }

    pub(crate) fn limit_interval(&self) -> (i64, i64) {
        self.command.lock().command.limit_interval
    }

    // Measurement handling

    /// Replaces (or, with `None`, just closes) the loaded measurement.
    ///
    /// Pauses the playback, rewinds to the first frame, resets the limit
    /// interval and the simulated clock, and publishes the new state
    /// immediately. Publishers of the old measurement are dropped with it.
    pub(crate) fn set_measurement(&self, new: Option<MeasurementContainer>) {
        {
            let mut state = self.command.lock();
            let now = self.clocks.monotonic();
            state.stopwatch.pause(now);
            let cmd = &mut state.command;
            cmd.playing = false;
            cmd.current_frame_index = 0;
            cmd.next_frame_index = 0;
            cmd.next_frame_set_manually = true;

            match &new {
                Some(container) if container.frame_count() > 0 => {
                    let first = container.timestamp(0);
                    let last_index = container.frame_count() - 1;
                    cmd.current_frame_timestamp = first;
                    cmd.next_frame_timestamp = first;
                    cmd.first_measurement_timestamp = first;
                    cmd.last_measurement_timestamp = container.timestamp(last_index);
                    cmd.limit_interval = (0, last_index);
                    cmd.limit_interval_times = (first, container.timestamp(last_index));
                }
                _ => {
                    cmd.current_frame_timestamp = Time(0);
                    cmd.next_frame_timestamp = Time(0);
                    cmd.first_measurement_timestamp = Time(0);
                    cmd.last_measurement_timestamp = Time(0);
                    cmd.limit_interval = (0, 0);
                    cmd.limit_interval_times = (Time(0), Time(0));
                }
            }
            let t = cmd.first_measurement_timestamp;
            anchor_sim_time(cmd, t, now);
            state.clear_time_log();
            self.pause_cv.notify_all();
        }
        {
            let mut measurement = self.measurement.write();
            *measurement = new;
        }
        self.sp.publish_now();
    }

    pub(crate) fn is_measurement_loaded(&self) -> bool {
        self.measurement.read().is_some()
    }

    pub(crate) fn measurement_path(&self) -> Option<PathBuf> {
        self.measurement.read().as_ref().map(|c| c.path().to_owned())
    }

    pub(crate) fn measurement_length(&self) -> Duration {
        self.measurement
            .read()
            .as_ref()
            .map(|c| c.measurement_length())
            .unwrap_or_default()
    }

    pub(crate) fn measurement_boundaries(&self) -> (Time, Time) {
        match self.measurement.read().as_ref() {
            Some(c) if c.frame_count() > 0 => {
                (c.timestamp(0), c.timestamp(c.frame_count() - 1))
            }
            _ => (Time(0), Time(0)),
        }
    }

    pub(crate) fn frame_count(&self) -> i64 {
        self.measurement
            .read()
            .as_ref()
            .map(|c| c.frame_count())
            .unwrap_or(0)
    }

    /// Index of the frame closest to `timestamp`, or `None` without a
    /// measurement.
    pub(crate) fn nearest_index(&self, timestamp: Time) -> Option<i64> {
        self.measurement
            .read()
            .as_ref()
            .map(|c| c.nearest_index(timestamp))
    }

    pub(crate) fn timestamp_of(&self, frame_index: i64) -> Option<Time> {
        let measurement = self.measurement.read();
        let container = measurement.as_ref()?;
        if frame_index < 0 || frame_index >= container.frame_count() {
            return None;
        }
        Some(container.timestamp(frame_index))
    }

    pub(crate) fn channel_names(&self) -> BTreeSet<String> {
        self.measurement
            .read()
            .as_ref()
            .map(|c| c.channel_names())
            .unwrap_or_default()
    }

    pub(crate) fn continuity_report(&self) -> BTreeMap<String, meas::ContinuityReport> {
        self.measurement
            .read()
            .as_ref()
            .map(|c| c.continuity_report())
            .unwrap_or_default()
    }

    pub(crate) fn message_counters(&self) -> BTreeMap<String, i64> {
        self.measurement
            .read()
            .as_ref()
            .map(|c| c.message_counters())
            .unwrap_or_default()
    }

    pub(crate) fn channel_mapping(&self) -> BTreeMap<String, String> {
        self.measurement
            .read()
            .as_ref()
            .map(|c| c.channel_mapping())
            .unwrap_or_default()
    }

    // Publishers

    /// (Re-)creates the bus publishers; identity-mapped unless a
    /// `{source → target}` mapping is given. Recomputes the next
    /// publishable frame from the current position.
    pub(crate) fn initialize_publishers(
        &self,
        channel_mapping: Option<&BTreeMap<String, String>>,
    ) -> Result<(), Error> {
        let (last_index, limit_interval, repeat_enabled) = {
            let state = self.command.lock();
            (
                state.command.current_frame_index,
                state.command.limit_interval,
                state.command.repeat_enabled,
            )
        };
        let (next_frame_index, next_frame_timestamp) = {
            let mut measurement = self.measurement.write();
            let Some(container) = measurement.as_mut() else {
                return Err(err!(FailedPrecondition, msg("no measurement loaded")));
            };
            match channel_mapping {
                Some(mapping) => {
                    info!("initializing {} publishers", mapping.len());
                    container.create_publishers_with(&*self.bus, mapping)?;
                }
                None => {
                    info!("initializing all publishers with recorded channel names");
                    container.create_publishers(&*self.bus)?;
                }
            }
            let next = container.next_enabled_index(last_index - 1, repeat_enabled, limit_interval);
            (next, container.timestamp(next))
        };
        let mut state = self.command.lock();
        state.command.next_frame_index = next_frame_index;
        state.command.next_frame_timestamp = next_frame_timestamp;
        self.pause_cv.notify_all();
        Ok(())
    }

    pub(crate) fn deinitialize_publishers(&self) -> bool {
        {
            let mut state = self.command.lock();
            self.set_playing(&mut state, false);
        }
        let mut measurement = self.measurement.write();
        match measurement.as_mut() {
            Some(container) => {
                info!("de-initializing publishers");
                container.deinit_publishers();
                true
            }
            None => false,
        }
    }

    pub(crate) fn publishers_initialized(&self) -> bool {
        self.measurement
            .read()
            .as_ref()
            .is_some_and(|c| c.publishers_created())
    }

    // Settings

    pub(crate) fn set_play_speed(&self, speed: f64) {
        info!("setting play speed to {speed}");
        let mut state = self.command.lock();
        if state.command.playing {
            // Commit the interpolated sim time so the rate change is
            // effective from now on the simulated clock.
            let now = self.clocks.monotonic();
            let current = interpolated_sim_time(&state.command, now);
            anchor_sim_time(&mut state.command, current, now);
        }
        state.command.play_speed = speed.max(0.0);
        self.pause_cv.notify_all();
        drop(state);
        self.sp.publish_now();
    }

    pub(crate) fn play_speed(&self) -> f64 {
        self.command.lock().command.play_speed
    }

    /// The observed rate over the last second of playback activity.
    pub(crate) fn current_play_speed(&self) -> f64 {
        observed_play_speed(&self.command.lock())
    }

    pub(crate) fn set_limit_play_speed_enabled(&self, enabled: bool) {
        info!("setting limit play speed to {enabled}");
        let mut state = self.command.lock();
        state.command.limit_play_speed = enabled;
        self.pause_cv.notify_all();
        drop(state);
    }

    pub(crate) fn is_limit_play_speed_enabled(&self) -> bool {
        self.command.lock().command.limit_play_speed
    }

    pub(crate) fn set_repeat_enabled(&self, enabled: bool) {
        info!("setting repeat to {enabled}");
        self.command.lock().command.repeat_enabled = enabled;
    }

    pub(crate) fn is_repeat_enabled(&self) -> bool {
        self.command.lock().command.repeat_enabled
    }

    pub(crate) fn set_framedropping_allowed(&self, allowed: bool) {
        info!("setting frame dropping to {allowed}");
        self.command.lock().command.framedropping_allowed = allowed;
    }

    pub(crate) fn is_framedropping_allowed(&self) -> bool {
        self.command.lock().command.framedropping_allowed
    }

    pub(crate) fn set_enforce_delay_accuracy_enabled(&self, enabled: bool) {
        info!("setting enforce delay accuracy to {enabled}");
        self.command.lock().command.enforce_delay_accuracy = enabled;
    }

    pub(crate) fn is_enforce_delay_accuracy_enabled(&self) -> bool {
        self.command.lock().command.enforce_delay_accuracy
    }

    // State snapshots

    pub(crate) fn is_playing(&self) -> bool {
        self.command.lock().command.playing
    }

    pub(crate) fn current_frame_index(&self) -> i64 {
        self.command.lock().command.current_frame_index
    }

    pub(crate) fn current_frame_timestamp(&self) -> Time {
        self.command.lock().command.current_frame_timestamp
    }

    pub(crate) fn current_play_state(&self) -> PlayState {
        let state = self.command.lock();
        PlayState {
            playing: state.command.playing,
            actual_play_rate: observed_play_speed(&state),
            current_frame_index: state.command.current_frame_index,
            current_frame_timestamp: state.command.current_frame_timestamp,
            sim_time: state.command.sim_time,
            sim_time_local_timestamp: state.command.sim_time_local_timestamp,
            // In unlimited mode real time has no meaning, so the published
            // rate is the observed one.
            sim_time_rate: if state.command.limit_play_speed {
                state.command.play_speed
            } else {
                observed_play_speed(&state)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::json::{self, SimTimeMsg, SimulationState};
    use crate::play::Player;
    use crate::testutil::{self, millis, RecordingBus};
    use base::clock::{Clocks, RealClocks, SimulatedClocks};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn player<C: Clocks>(
        bus: &Arc<RecordingBus>,
        clocks: C,
        frames: &[(&str, i64)],
    ) -> Player<C> {
        testutil::init_logging();
        let player = Player::with_clocks(bus.clone(), clocks).unwrap();
        player
            .load_backend(testutil::backend(frames), PathBuf::from("/data/run1"), true)
            .unwrap();
        player
    }

    fn data_timestamps_ms(bus: &RecordingBus) -> Vec<i64> {
        bus.data_messages()
            .iter()
            .map(|m| m.timestamp.0 / 1_000)
            .collect()
    }

    #[test]
    fn limited_speed_plays_everything_then_pauses_and_rewinds() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(
            &bus,
            SimulatedClocks::new(),
            &[("a", 0), ("a", 100), ("a", 200), ("a", 300)],
        );
        assert!(p.play());
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 4);

        assert_eq!(data_timestamps_ms(&bus), vec![0, 100, 200, 300]);
        assert_eq!(p.message_counters()["a"], 4);
        // Nothing more to play: the position rewinds to the front of the
        // limit interval so a subsequent play starts over.
        assert_eq!(p.current_frame_index(), 0);
        assert!(p.is_paused());

        // The sim time topic settles on "paused" with the rewound clock.
        testutil::wait_for(|| {
            bus.messages_on(json::SIM_TIME_TOPIC).last().is_some_and(|m| {
                let msg: SimTimeMsg = serde_json::from_slice(&m.payload).unwrap();
                msg.simulation_state == SimulationState::Paused
            })
        });
    }

    #[test]
    fn replaying_after_the_end_publishes_the_same_frames_again() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(&bus, SimulatedClocks::new(), &[("a", 0), ("a", 50)]);
        assert!(p.play());
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 2);
        assert!(p.play());
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 4);
        assert_eq!(data_timestamps_ms(&bus), vec![0, 50, 0, 50]);
        assert_eq!(p.message_counters()["a"], 4);
    }

    #[test]
    fn repeat_cycles_within_the_limit_interval() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(
            &bus,
            SimulatedClocks::new(),
            &[("x", 0), ("x", 10), ("x", 20), ("x", 30), ("x", 40)],
        );
        p.set_repeat_enabled(true);
        assert!(p.set_limit_interval_by_indices((1, 3)));
        assert_eq!(p.current_frame_index(), 1); // moved to the lower bound
        assert!(p.play());
        testutil::wait_for(|| bus.data_messages().len() >= 10);
        p.pause();

        let ts = data_timestamps_ms(&bus);
        for (i, t) in ts.iter().take(9).enumerate() {
            assert_eq!(*t, 10 * (1 + (i as i64) % 3), "frame {i} of {ts:?}");
        }
        let state = p.state_message();
        assert_eq!(state.settings.limit_interval_lower_index, 1);
        assert_eq!(state.settings.limit_interval_upper_index, 3);
        assert!(state.settings.repeat_enabled);
        // The paused position stays inside the interval.
        assert!((1..=3).contains(&p.current_frame_index()));
        let sim = p.current_play_state().sim_time;
        assert!((millis(10)..=millis(30)).contains(&sim), "{sim:?}");
    }

    #[test]
    fn framedropping_skips_frames_that_are_already_late() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(
            &bus,
            RealClocks,
            &[("x", 0), ("x", 10), ("x", 20), ("x", 1000)],
        );
        p.set_framedropping_allowed(true);
        bus.push_send_stall(std::time::Duration::from_millis(50));
        assert!(p.play());
        testutil::wait_for(|| p.is_paused() && !bus.data_messages().is_empty());

        // The stall makes frames at 10 and 20 ms late; they are dropped.
        assert_eq!(data_timestamps_ms(&bus), vec![0, 1000]);
        assert_eq!(p.message_counters()["x"], 2);
    }

    #[test]
    fn delay_accuracy_publishes_every_frame_despite_the_stall() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(
            &bus,
            RealClocks,
            &[("x", 0), ("x", 10), ("x", 20), ("x", 1000)],
        );
        p.set_enforce_delay_accuracy_enabled(true);
        bus.push_send_stall(std::time::Duration::from_millis(50));
        let started = std::time::Instant::now();
        assert!(p.play());
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 4);

        assert_eq!(data_timestamps_ms(&bus), vec![0, 10, 20, 1000]);
        // The whole pass slows down globally instead of dropping.
        assert!(started.elapsed() >= std::time::Duration::from_millis(1000));
    }

    #[test]
    fn step_channel_plays_up_to_the_reference_channel() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(
            &bus,
            SimulatedClocks::new(),
            &[("a", 0), ("b", 10), ("a", 20), ("c", 30), ("a", 40)],
        );
        assert!(p.play_to_next_occurrence("a"));
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 3);

        assert_eq!(data_timestamps_ms(&bus), vec![0, 10, 20]);
        assert_eq!(p.current_frame_index(), 2);
        assert_eq!(p.current_play_state().sim_time, millis(20));
        assert!(p.is_paused());
    }

    #[test]
    fn step_forward_publishes_exactly_one_frame() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(&bus, SimulatedClocks::new(), &[("a", 0), ("b", 10), ("a", 20)]);
        assert!(p.step_forward());
        assert_eq!(data_timestamps_ms(&bus), vec![0]);
        assert_eq!(p.current_frame_index(), 0);
        assert_eq!(p.current_play_state().sim_time, millis(0));
        assert!(p.step_forward());
        assert!(p.step_forward());
        // Stepping wraps at the end regardless of the repeat setting.
        assert!(p.step_forward());
        assert_eq!(data_timestamps_ms(&bus), vec![0, 10, 20, 0]);
        assert!(p.is_paused());
    }

    #[test]
    fn seek_during_sleep_redirects_the_next_publish() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(
            &bus,
            RealClocks,
            &[
                ("a", 0),
                ("a", 50),
                ("a", 10_000),
                ("a", 10_050),
                ("a", 10_100),
            ],
        );
        assert!(p.play());
        testutil::wait_for(|| bus.data_messages().len() >= 2);
        std::thread::sleep(std::time::Duration::from_millis(50));

        // The player is now sleeping until sim time 10 s.
        let states_before = bus.messages_on(json::STATE_TOPIC).len();
        assert!(p.jump_to_index(4));
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 3);

        // Frame 4 comes next; 2 and 3 are never published.
        assert_eq!(data_timestamps_ms(&bus), vec![0, 50, 10_100]);
        // The seek triggered an immediate state publish.
        testutil::wait_for(|| bus.messages_on(json::STATE_TOPIC).len() > states_before);
    }

    #[test]
    fn unlimited_speed_ignores_frame_timing() {
        let bus = Arc::new(RecordingBus::new());
        let frames: Vec<(&str, i64)> = (0..100).map(|i| ("a", i * 2)).collect();
        let p = player(&bus, RealClocks, &frames);
        for _ in 0..100 {
            bus.push_send_stall(std::time::Duration::from_micros(500));
        }
        p.set_limit_play_speed_enabled(false);
        let started = std::time::Instant::now();
        assert!(p.play());
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 100);

        assert_eq!(bus.data_messages().len(), 100);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        // 198 ms of sim time passed in ~50 ms of wall time; the reported
        // rates are the observed ones, not the configured speed.
        let observed = p.current_play_speed();
        assert!(observed > 1.5, "observed rate {observed}");
        let state = p.state_message();
        assert!((state.actual_speed - observed).abs() < 1e-6);
        let sim = p.sim_time_message();
        assert!(sim.real_time_factor > 1.5, "{}", sim.real_time_factor);
    }

    #[test]
    fn speed_zero_blocks_until_the_rate_changes() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(&bus, RealClocks, &[("a", 0), ("a", 10)]);
        p.set_play_speed(0.0);
        assert!(p.play());
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(bus.data_messages().is_empty());
        assert!(p.is_playing());

        p.set_play_speed(1.0);
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 2);
        assert_eq!(data_timestamps_ms(&bus), vec![0, 10]);
    }

    #[test]
    fn disabling_the_speed_limit_mid_sleep_releases_the_wait() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(&bus, RealClocks, &[("a", 0), ("a", 60_000)]);
        assert!(p.play());
        testutil::wait_for(|| !bus.data_messages().is_empty());

        // Sleeping towards sim time 60 s now; this must release it.
        p.set_limit_play_speed_enabled(false);
        testutil::wait_for(|| p.is_paused() && bus.data_messages().len() >= 2);
        assert_eq!(data_timestamps_ms(&bus), vec![0, 60_000]);
    }

    #[test]
    fn closing_during_playback_stops_and_clears() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(&bus, RealClocks, &[("a", 0), ("a", 30_000)]);
        assert!(p.play());
        testutil::wait_for(|| !bus.data_messages().is_empty());
        p.close_measurement();
        assert!(p.is_paused());
        assert!(!p.is_measurement_loaded());
        let sim = p.sim_time_message();
        assert_eq!(sim.simulation_state, SimulationState::Stopped);
        // Replaying afterwards is a clean failure.
        assert!(!p.play());
    }

    #[test]
    fn reinitializing_publishers_keeps_the_position_playable() {
        let bus = Arc::new(RecordingBus::new());
        let p = player(&bus, SimulatedClocks::new(), &[("a", 0), ("b", 10), ("a", 20)]);
        assert!(p.jump_to_index(1));
        // Restrict to channel "a": the next playable frame from the current
        // position is recomputed (index 2; index 1 is not mapped).
        let mapping = [("a".to_owned(), "a".to_owned())].into();
        p.initialize_publishers_with(&mapping).unwrap();
        assert!(p.play());
        testutil::wait_for(|| p.is_paused() && !bus.data_messages().is_empty());
        assert_eq!(data_timestamps_ms(&bus), vec![20]);
        assert_eq!(p.message_counters(), [("a".to_owned(), 1)].into());
    }
}
