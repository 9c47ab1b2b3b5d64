// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Serde types for the bus-visible snapshot topics.

use serde::{Deserialize, Serialize};

/// Topic carrying [`PlayerStateMsg`].
pub const STATE_TOPIC: &str = "__tapedeck_state__";

/// Topic carrying [`SimTimeMsg`].
pub const SIM_TIME_TOPIC: &str = "__sim_time__";

/// Full player status snapshot, published at 2 Hz and on demand.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PlayerStateMsg {
    pub host_name: String,
    pub process_id: u32,
    pub playing: bool,
    pub measurement_loaded: bool,
    /// Observed play rate over the last second of playback activity.
    pub actual_speed: f64,
    pub current_measurement_index: i64,
    pub current_measurement_timestamp_nsecs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_info: Option<MeasurementInfoMsg>,
    pub settings: SettingsMsg,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MeasurementInfoMsg {
    pub path: String,
    pub frame_count: i64,
    pub first_timestamp_nsecs: i64,
    pub last_timestamp_nsecs: i64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SettingsMsg {
    pub play_speed: f64,
    pub limit_play_speed: bool,
    pub repeat_enabled: bool,
    pub framedropping_allowed: bool,
    pub enforce_delay_accuracy_enabled: bool,
    pub limit_interval_lower_index: i64,
    pub limit_interval_upper_index: i64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationState {
    /// No measurement loaded.
    Stopped,
    Paused,
    Playing,
}

/// Simulation clock snapshot for other processes to synchronize to.
///
/// Consumers interpolate the current simulated time as
/// `simulation_time_nsecs + (local_now - local_time_nsecs) * real_time_factor`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SimTimeMsg {
    pub simulation_state: SimulationState,
    pub simulation_time_nsecs: i64,
    pub real_time_factor: f64,
    pub local_time_nsecs: i64,
    pub host_name: String,
    pub process_id: u32,
}

pub fn host_name() -> String {
    static HOST_NAME: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    HOST_NAME
        .get_or_init(|| {
            nix::unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_owned())
        })
        .clone()
}
