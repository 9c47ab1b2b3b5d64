// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The thin, thread-safe public API of the player.
//!
//! Forwards to the engine; holds no playback state of its own beyond the
//! user-supplied measurement path. Used by the CLI and the control service
//! alike.

use crate::engine::{Engine, PlayState};
use crate::json::{PlayerStateMsg, SimTimeMsg};
use crate::state_publisher;
use base::clock::{Clocks, RealClocks};
use base::time::{Duration, Time};
use base::{Error, Mutex};
use meas::{MeasurementBackend, MeasurementContainer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct Player<C: Clocks = RealClocks> {
    engine: Engine<C>,
    /// The path the user loaded from, which may differ in spelling from the
    /// container's normalized one.
    measurement_path: Mutex<Option<PathBuf>>,
}

impl Player<RealClocks> {
    pub fn new(bus: Arc<dyn bus::Bus>) -> Result<Self, Error> {
        Self::with_clocks(bus, RealClocks)
    }
}

impl<C: Clocks> Player<C> {
    pub fn with_clocks(bus: Arc<dyn bus::Bus>, clocks: C) -> Result<Self, Error> {
        Ok(Player {
            engine: Engine::new(bus, clocks)?,
            measurement_path: Mutex::new(None),
        })
    }

    // Measurement loading

    /// Loads a tape file. On failure the previously loaded measurement, if
    /// any, stays untouched.
    pub fn load_measurement(
        &self,
        path: &Path,
        use_receive_timestamp: bool,
    ) -> Result<(), Error> {
        info!("loading measurement from {}", path.display());
        let backend = Arc::new(meas::file::TapeFile::open(path)?);
        self.load_backend(backend, path.to_owned(), use_receive_timestamp)
    }

    /// Loads an already-open backend; also the entry point for synthetic
    /// measurements in tests and tooling.
    pub fn load_backend(
        &self,
        backend: Arc<dyn MeasurementBackend>,
        path: PathBuf,
        use_receive_timestamp: bool,
    ) -> Result<(), Error> {
        let container = MeasurementContainer::new(backend, path.clone(), use_receive_timestamp)?;
        info!(
            "measurement loaded: {} frames on {} channels, {}",
            container.frame_count(),
            container.channel_names().len(),
            container.measurement_length(),
        );
        self.engine.inner().set_measurement(Some(container));
        *self.measurement_path.lock() = Some(path);
        Ok(())
    }

    pub fn close_measurement(&self) {
        self.engine.inner().set_measurement(None);
        *self.measurement_path.lock() = None;
    }

    pub fn is_measurement_loaded(&self) -> bool {
        self.engine.inner().is_measurement_loaded()
    }

    pub fn measurement_path(&self) -> Option<PathBuf> {
        self.measurement_path.lock().clone()
    }

    pub fn measurement_length(&self) -> Duration {
        self.engine.inner().measurement_length()
    }

    pub fn measurement_boundaries(&self) -> (Time, Time) {
        self.engine.inner().measurement_boundaries()
    }

    pub fn frame_count(&self) -> i64 {
        self.engine.inner().frame_count()
    }

    pub fn timestamp_of(&self, frame_index: i64) -> Option<Time> {
        self.engine.inner().timestamp_of(frame_index)
    }

    /// Index of the frame closest to `timestamp`, or `None` without a
    /// measurement.
    pub fn nearest_index(&self, timestamp: Time) -> Option<i64> {
        self.engine.inner().nearest_index(timestamp)
    }

    pub fn channel_names(&self) -> BTreeSet<String> {
        self.engine.inner().channel_names()
    }

    pub fn continuity_report(&self) -> BTreeMap<String, meas::ContinuityReport> {
        self.engine.inner().continuity_report()
    }

    pub fn message_counters(&self) -> BTreeMap<String, i64> {
        self.engine.inner().message_counters()
    }

    // Playback

    pub fn play(&self) -> bool {
        self.engine.inner().play(-1)
    }

    pub fn play_until(&self, index: i64) -> bool {
        self.engine.inner().play(index)
    }

    pub fn play_to_next_occurrence(&self, source_channel_name: &str) -> bool {
        self.engine.inner().play_to_next_occurrence(source_channel_name)
    }

    pub fn pause(&self) -> bool {
        self.engine.inner().pause()
    }

    pub fn step_forward(&self) -> bool {
        self.engine.inner().step_forward()
    }

    pub fn jump_to_index(&self, index: i64) -> bool {
        self.engine.inner().jump_to_index(index)
    }

    pub fn jump_to_timestamp(&self, timestamp: Time) -> bool {
        self.engine.inner().jump_to_timestamp(timestamp)
    }

    /// Seeks to an offset relative to the first measurement timestamp.
    pub fn jump_to_rel_secs(&self, rel_secs: f64) -> bool {
        let (first, _) = self.engine.inner().measurement_boundaries();
        self.engine
            .inner()
            .jump_to_timestamp(first + Duration::from_secs_f64(rel_secs))
    }

    // Publishers

    pub fn initialize_publishers(&self) -> Result<(), Error> {
        self.engine.inner().initialize_publishers(None)
    }

    pub fn initialize_publishers_with(
        &self,
        channel_mapping: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.engine.inner().initialize_publishers(Some(channel_mapping))
    }

    pub fn deinitialize_publishers(&self) -> bool {
        self.engine.inner().deinitialize_publishers()
    }

    pub fn publishers_initialized(&self) -> bool {
        self.engine.inner().publishers_initialized()
    }

    pub fn channel_mapping(&self) -> BTreeMap<String, String> {
        self.engine.inner().channel_mapping()
    }

    // Settings

    pub fn set_limit_interval_by_indices(&self, interval: (i64, i64)) -> bool {
        self.engine.inner().set_limit_interval_by_indices(interval)
    }

    pub fn set_limit_interval_by_timestamps(&self, interval: (Time, Time)) -> bool {
        self.engine.inner().set_limit_interval_by_timestamps(interval)
    }

    pub fn limit_interval(&self) -> (i64, i64) {
        self.engine.inner().limit_interval()
    }

    pub fn set_play_speed(&self, speed: f64) {
        self.engine.inner().set_play_speed(speed)
    }

    pub fn play_speed(&self) -> f64 {
        self.engine.inner().play_speed()
    }

    /// The observed rate over the last second of playback activity.
    pub fn current_play_speed(&self) -> f64 {
        self.engine.inner().current_play_speed()
    }

    pub fn set_limit_play_speed_enabled(&self, enabled: bool) {
        self.engine.inner().set_limit_play_speed_enabled(enabled)
    }

    pub fn is_limit_play_speed_enabled(&self) -> bool {
        self.engine.inner().is_limit_play_speed_enabled()
    }

    pub fn set_repeat_enabled(&self, enabled: bool) {
        self.engine.inner().set_repeat_enabled(enabled)
    }

    pub fn is_repeat_enabled(&self) -> bool {
        self.engine.inner().is_repeat_enabled()
    }

    pub fn set_framedropping_allowed(&self, allowed: bool) {
        self.engine.inner().set_framedropping_allowed(allowed)
    }

    pub fn is_framedropping_allowed(&self) -> bool {
        self.engine.inner().is_framedropping_allowed()
    }

    pub fn set_enforce_delay_accuracy_enabled(&self, enabled: bool) {
        self.engine.inner().set_enforce_delay_accuracy_enabled(enabled)
    }

    pub fn is_enforce_delay_accuracy_enabled(&self) -> bool {
        self.engine.inner().is_enforce_delay_accuracy_enabled()
    }

    // State

    pub fn is_playing(&self) -> bool {
        self.engine.inner().is_playing()
    }

    pub fn is_paused(&self) -> bool {
        !self.is_playing()
    }

    pub fn current_frame_index(&self) -> i64 {
        self.engine.inner().current_frame_index()
    }

    pub fn current_frame_timestamp(&self) -> Time {
        self.engine.inner().current_frame_timestamp()
    }

    pub fn current_play_state(&self) -> PlayState {
        self.engine.inner().current_play_state()
    }

    /// The same payload the state publisher emits on the bus.
    pub fn state_message(&self) -> PlayerStateMsg {
        state_publisher::build_state_message(self.engine.inner())
    }

    pub fn sim_time_message(&self) -> SimTimeMsg {
        state_publisher::build_sim_time_message(self.engine.inner())
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{self, millis, RecordingBus};
    use base::clock::SimulatedClocks;
    use base::time::Time;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn player_with_frames(
        frames: &[(&str, i64)],
    ) -> (super::Player<SimulatedClocks>, Arc<RecordingBus>) {
        let bus = Arc::new(RecordingBus::new());
        let player =
            super::Player::with_clocks(bus.clone(), SimulatedClocks::new()).unwrap();
        player
            .load_backend(testutil::backend(frames), PathBuf::from("/data/run1"), true)
            .unwrap();
        (player, bus)
    }

    #[test]
    fn operations_without_measurement_fail_cleanly() {
        let bus = Arc::new(RecordingBus::new());
        let player = super::Player::with_clocks(bus, SimulatedClocks::new()).unwrap();
        assert!(!player.is_measurement_loaded());
        assert!(!player.play());
        assert!(!player.step_forward());
        assert!(!player.jump_to_index(3));
        assert!(!player.set_limit_interval_by_indices((0, 1)));
        assert!(player.initialize_publishers().is_err());
        assert!(!player.deinitialize_publishers());
        assert_eq!(player.frame_count(), 0);
        assert_eq!(player.timestamp_of(0), None);
    }

    #[test]
    fn load_resets_position_and_limits() {
        let (player, _bus) = player_with_frames(&[("a", 0), ("a", 100), ("b", 200)]);
        assert!(player.is_measurement_loaded());
        assert_eq!(player.measurement_path(), Some(PathBuf::from("/data/run1")));
        assert_eq!(player.frame_count(), 3);
        assert_eq!(player.limit_interval(), (0, 2));
        assert_eq!(player.current_frame_index(), 0);
        assert_eq!(player.measurement_boundaries(), (millis(0), millis(200)));
        assert_eq!(player.timestamp_of(1), Some(millis(100)));
        assert_eq!(player.timestamp_of(99), None);

        player.close_measurement();
        assert!(!player.is_measurement_loaded());
        assert_eq!(player.measurement_path(), None);
        assert_eq!(player.limit_interval(), (0, 0));
    }

    #[test]
    fn pause_is_idempotent() {
        let (player, _bus) = player_with_frames(&[("a", 0), ("a", 100)]);
        assert!(player.pause());
        let state = player.current_play_state();
        assert!(player.pause());
        let again = player.current_play_state();
        assert!(!again.playing);
        assert_eq!(again.current_frame_index, state.current_frame_index);
        assert_eq!(again.sim_time, state.sim_time);
    }

    #[test]
    fn play_speed_is_clamped_to_non_negative() {
        let (player, _bus) = player_with_frames(&[("a", 0)]);
        player.set_play_speed(2.5);
        assert_eq!(player.play_speed(), 2.5);
        player.set_play_speed(-1.0);
        assert_eq!(player.play_speed(), 0.0);
    }

    #[test]
    fn seek_to_a_frame_timestamp_lands_on_its_index() {
        let (player, _bus) = player_with_frames(&[("a", 0), ("a", 100), ("a", 200)]);
        assert!(player.jump_to_timestamp(millis(100)));
        assert_eq!(player.current_frame_index(), 1);
        assert_eq!(player.current_frame_timestamp(), millis(100));
        // Off-grid timestamps land on the nearest frame.
        assert!(player.jump_to_timestamp(millis(170)));
        assert_eq!(player.current_frame_index(), 2);
        // Relative seeks are anchored at the first measurement timestamp.
        assert!(player.jump_to_rel_secs(0.1));
        assert_eq!(player.current_frame_index(), 1);
    }

    #[test]
    fn seek_clamps_to_limit_interval() {
        let (player, _bus) = player_with_frames(&[("a", 0), ("a", 100), ("a", 200), ("a", 300)]);
        assert!(player.set_limit_interval_by_indices((1, 2)));
        assert!(player.jump_to_index(3));
        assert_eq!(player.current_frame_index(), 2);
        assert!(player.jump_to_index(-7));
        assert_eq!(player.current_frame_index(), 1);
    }

    #[test]
    fn limit_interval_change_moves_an_outside_position() {
        let (player, _bus) = player_with_frames(&[("a", 0), ("a", 100), ("a", 200), ("a", 300)]);
        assert_eq!(player.current_frame_index(), 0);
        assert!(player.set_limit_interval_by_indices((2, 3)));
        assert_eq!(player.current_frame_index(), 2);
        let state = player.current_play_state();
        assert_eq!(state.sim_time, millis(200));

        // By timestamps, in either order, and clamped to the measurement.
        assert!(player.set_limit_interval_by_timestamps((millis(5_000), millis(100))));
        assert_eq!(player.limit_interval(), (1, 3));
    }

    #[test]
    fn publisher_lifecycle() {
        let (player, bus) = player_with_frames(&[("a", 0), ("b", 100)]);
        assert!(!player.publishers_initialized());
        player.initialize_publishers().unwrap();
        assert!(player.publishers_initialized());
        assert_eq!(
            player.channel_mapping(),
            [("a", "a"), ("b", "b")]
                .into_iter()
                .map(|(s, t)| (s.to_owned(), t.to_owned()))
                .collect()
        );

        let mapping = [("a".to_owned(), "replay/a".to_owned())].into();
        player.initialize_publishers_with(&mapping).unwrap();
        assert_eq!(player.channel_mapping(), mapping);

        assert!(player.step_forward());
        testutil::wait_for(|| !bus.data_messages().is_empty());
        assert_eq!(bus.data_messages()[0].topic, "replay/a");

        assert!(player.deinitialize_publishers());
        assert!(!player.publishers_initialized());
        assert!(player.channel_mapping().is_empty());
        assert!(player.message_counters().is_empty());
    }
}
