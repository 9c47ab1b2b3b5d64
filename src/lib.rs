// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tapedeck replays recorded pub/sub measurements onto the live bus,
//! reproducing the original inter-message timing.
//!
//! [`play::Player`] is the public surface: load a measurement, control the
//! playback (play / pause / step / seek / limit / rate), and watch the
//! engine report its status and a simulation clock on two bus topics.
//! [`service::PlayerService`] is the string-typed control surface for
//! remote configuration, shared with the interactive CLI.

pub mod cmds;
pub(crate) mod command;
pub mod engine;
pub mod json;
pub mod play;
pub mod service;
mod state_publisher;
#[cfg(test)]
mod testutil;
