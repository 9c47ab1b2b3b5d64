// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The string-typed control surface remote services and the interactive CLI
//! drive the player through. Transport-free: an RPC wrapper (or a terminal
//! loop) parses its own envelope and calls in here.

use crate::json::PlayerStateMsg;
use crate::play::Player;
use base::clock::{Clocks, RealClocks};
use base::time::Duration;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServiceResponse {
    Ok,
    Failed(String),
}

impl ServiceResponse {
    fn failed(reason: impl Into<String>) -> Self {
        ServiceResponse::Failed(reason.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ServiceResponse::Ok)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ServiceResponse::Ok => None,
            ServiceResponse::Failed(reason) => Some(reason),
        }
    }
}

/// A control command, with its optional argument already typed.
#[derive(Clone, Debug)]
pub enum Command {
    Initialize {
        channel_mapping: Option<BTreeMap<String, String>>,
    },
    DeInitialize,
    JumpTo {
        rel_secs: f64,
    },
    Play {
        until_rel_secs: Option<f64>,
    },
    Pause,
    Step,
    StepChannel {
        source_channel_name: String,
    },
    Exit,
}

pub struct PlayerService<C: Clocks = RealClocks> {
    player: Arc<Player<C>>,
    exit_requested: AtomicBool,
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(format!("cannot parse {key} value {value:?} as bool")),
    }
}

fn parse_f64(key: &str, value: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .map_err(|_| format!("cannot parse {key} value {value:?} as number"))
}

impl<C: Clocks> PlayerService<C> {
    pub fn new(player: Arc<Player<C>>) -> Self {
        PlayerService {
            player,
            exit_requested: AtomicBool::new(false),
        }
    }

    /// True once an `exit` command arrived; the host decides what that
    /// means (the CLI leaves its control loop).
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// All settings as strings, for generic remote configuration UIs.
    pub fn get_config(&self) -> BTreeMap<String, String> {
        let (first, _) = self.player.measurement_boundaries();
        let limit_interval = self.player.limit_interval();
        let limit_start = self.player.timestamp_of(limit_interval.0).unwrap_or(first);
        let limit_end = self.player.timestamp_of(limit_interval.1).unwrap_or(first);
        let mut config = BTreeMap::new();
        config.insert(
            "measurement_path".to_owned(),
            self.player
                .measurement_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        config.insert(
            "limit_play_speed".to_owned(),
            self.player.is_limit_play_speed_enabled().to_string(),
        );
        config.insert(
            "play_speed".to_owned(),
            self.player.play_speed().to_string(),
        );
        config.insert(
            "frame_dropping_allowed".to_owned(),
            self.player.is_framedropping_allowed().to_string(),
        );
        config.insert(
            "enforce_delay_accuracy".to_owned(),
            self.player.is_enforce_delay_accuracy_enabled().to_string(),
        );
        config.insert(
            "repeat".to_owned(),
            self.player.is_repeat_enabled().to_string(),
        );
        config.insert(
            "limit_interval_start_rel_secs".to_owned(),
            (limit_start - first).as_secs_f64().to_string(),
        );
        config.insert(
            "limit_interval_end_rel_secs".to_owned(),
            (limit_end - first).as_secs_f64().to_string(),
        );
        config
    }

    /// Applies every recognized key. Keys are handled independently; the
    /// first failure is reported after the rest have been applied.
    pub fn set_config(&self, config: &BTreeMap<String, String>) -> ServiceResponse {
        let mut first_error: Option<String> = None;
        let mut fail = |e: String| {
            if first_error.is_none() {
                first_error = Some(e);
            }
        };

        if let Some(path) = config.get("measurement_path") {
            if path.is_empty() {
                fail("measurement_path is empty".to_owned());
            } else if let Err(err) = self.player.load_measurement(Path::new(path), true) {
                fail(format!("unable to load measurement from {path}: {err}"));
            }
        }

        let start_rel = config.get("limit_interval_start_rel_secs");
        let end_rel = config.get("limit_interval_end_rel_secs");
        if start_rel.is_some() || end_rel.is_some() {
            match self.parse_limit_interval(start_rel, end_rel) {
                Ok(interval) => {
                    if !self.player.set_limit_interval_by_timestamps(interval) {
                        fail("unable to set limit interval (no measurement?)".to_owned());
                    }
                }
                Err(e) => fail(e),
            }
        }

        if let Some(value) = config.get("limit_play_speed") {
            match parse_bool("limit_play_speed", value) {
                Ok(enabled) => self.player.set_limit_play_speed_enabled(enabled),
                Err(e) => fail(e),
            }
        }
        if let Some(value) = config.get("play_speed") {
            match parse_f64("play_speed", value) {
                Ok(speed) => self.player.set_play_speed(speed),
                Err(e) => fail(e),
            }
        }
        if let Some(value) = config.get("frame_dropping_allowed") {
            match parse_bool("frame_dropping_allowed", value) {
                Ok(allowed) => self.player.set_framedropping_allowed(allowed),
                Err(e) => fail(e),
            }
        }
        if let Some(value) = config.get("enforce_delay_accuracy") {
            match parse_bool("enforce_delay_accuracy", value) {
                Ok(enabled) => self.player.set_enforce_delay_accuracy_enabled(enabled),
                Err(e) => fail(e),
            }
        }
        if let Some(value) = config.get("repeat") {
            match parse_bool("repeat", value) {
                Ok(enabled) => self.player.set_repeat_enabled(enabled),
                Err(e) => fail(e),
            }
        }

        match first_error {
            None => ServiceResponse::Ok,
            Some(e) => ServiceResponse::failed(e),
        }
    }

    fn parse_limit_interval(
        &self,
        start_rel: Option<&String>,
        end_rel: Option<&String>,
    ) -> Result<(base::time::Time, base::time::Time), String> {
        let (first, last) = self.player.measurement_boundaries();
        let limit_interval = self.player.limit_interval();
        let mut start = self.player.timestamp_of(limit_interval.0).unwrap_or(first);
        let mut end = self.player.timestamp_of(limit_interval.1).unwrap_or(last);
        if let Some(value) = start_rel {
            start = first + Duration::from_secs_f64(parse_f64("limit_interval_start_rel_secs", value)?);
        }
        if let Some(value) = end_rel {
            end = first + Duration::from_secs_f64(parse_f64("limit_interval_end_rel_secs", value)?);
        }
        Ok((start, end))
    }

    pub fn set_command(&self, command: Command) -> ServiceResponse {
        match command {
            Command::Initialize { channel_mapping } => {
                let result = match &channel_mapping {
                    Some(mapping) => self.player.initialize_publishers_with(mapping),
                    None => self.player.initialize_publishers(),
                };
                match result {
                    Ok(()) => ServiceResponse::Ok,
                    Err(err) => {
                        ServiceResponse::failed(format!("unable to initialize publishers: {err}"))
                    }
                }
            }
            Command::DeInitialize => {
                if self.player.deinitialize_publishers() {
                    ServiceResponse::Ok
                } else {
                    ServiceResponse::failed("unable to de-initialize publishers")
                }
            }
            Command::JumpTo { rel_secs } => {
                if self.player.jump_to_rel_secs(rel_secs) {
                    ServiceResponse::Ok
                } else {
                    ServiceResponse::failed("unable to jump (no measurement loaded?)")
                }
            }
            Command::Play { until_rel_secs } => {
                let until_index = match until_rel_secs {
                    None => -1,
                    Some(rel_secs) => {
                        let (first, _) = self.player.measurement_boundaries();
                        match self
                            .player
                            .nearest_index(first + Duration::from_secs_f64(rel_secs))
                        {
                            Some(index) => index,
                            None => {
                                return ServiceResponse::failed("no measurement loaded");
                            }
                        }
                    }
                };
                if self.player.play_until(until_index) {
                    ServiceResponse::Ok
                } else {
                    ServiceResponse::failed("unable to play (no measurement loaded?)")
                }
            }
            Command::Pause => {
                self.player.pause();
                ServiceResponse::Ok
            }
            Command::Step => {
                if self.player.step_forward() {
                    ServiceResponse::Ok
                } else {
                    ServiceResponse::failed("unable to step (no measurement loaded?)")
                }
            }
            Command::StepChannel {
                source_channel_name,
            } => {
                if self.player.play_to_next_occurrence(&source_channel_name) {
                    ServiceResponse::Ok
                } else {
                    ServiceResponse::failed("unable to step channel (no measurement loaded?)")
                }
            }
            Command::Exit => {
                self.player.pause();
                self.exit_requested.store(true, Ordering::SeqCst);
                ServiceResponse::Ok
            }
        }
    }

    pub fn get_state(&self) -> PlayerStateMsg {
        self.player.state_message()
    }
}
