// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared helpers for the engine and facade tests: a bus that records every
//! send, synthetic measurements, and polling helpers.

use base::time::Time;
use base::{Error, Mutex};
use bytes::Bytes;
use meas::mem::MemBackend;
use std::collections::VecDeque;
use std::sync::Arc;

pub fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(base::tracing_setup::install_for_tests);
}

pub fn millis(ms: i64) -> Time {
    Time(ms * 1_000)
}

/// A synthetic measurement: one entry per `(channel, milliseconds)` pair,
/// with `send == receive` timestamps and recognizable payloads.
pub fn backend(frames: &[(&str, i64)]) -> Arc<MemBackend> {
    let mut builder = MemBackend::builder();
    for (channel, ms) in frames {
        builder = builder.entry(
            channel,
            millis(*ms),
            format!("{channel}@{ms}").as_bytes(),
        );
    }
    Arc::new(builder.build())
}

/// Polls `condition` (for up to 10 s of real time) until it holds.
#[track_caller]
pub fn wait_for<F: Fn() -> bool>(condition: F) {
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > std::time::Duration::from_secs(10) {
            panic!("condition not reached within 10 s");
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
}

#[derive(Clone, Debug)]
pub struct SentMessage {
    pub topic: String,
    pub timestamp: Time,
    pub payload: Bytes,
}

impl SentMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

#[derive(Default)]
struct RecordingState {
    messages: Mutex<Vec<SentMessage>>,
    /// Real-time stalls popped by data sends, for provoking late frames.
    send_stalls: Mutex<VecDeque<std::time::Duration>>,
}

/// A [`bus::Bus`] that records every sent message in order.
///
/// Snapshot topics (leading double underscore) are recorded but never
/// stalled, so injected delays hit only the player's data path.
#[derive(Default)]
pub struct RecordingBus {
    state: Arc<RecordingState>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-shot stall; each data send pops at most one.
    pub fn push_send_stall(&self, stall: std::time::Duration) {
        self.state.send_stalls.lock().push_back(stall);
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.state.messages.lock().clone()
    }

    /// Everything that is not a snapshot topic, i.e. replayed frames.
    pub fn data_messages(&self) -> Vec<SentMessage> {
        self.messages()
            .into_iter()
            .filter(|m| !m.topic.starts_with("__"))
            .collect()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<SentMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

impl bus::Bus for RecordingBus {
    fn create_publisher(
        &self,
        topic: &str,
        _info: &bus::DataTypeInfo,
    ) -> Result<Box<dyn bus::Publisher>, Error> {
        Ok(Box::new(RecordingPublisher {
            topic: topic.to_owned(),
            state: self.state.clone(),
        }))
    }
}

struct RecordingPublisher {
    topic: String,
    state: Arc<RecordingState>,
}

impl bus::Publisher for RecordingPublisher {
    fn topic_name(&self) -> &str {
        &self.topic
    }

    fn send(&self, payload: &[u8], timestamp: Time) -> bool {
        if !self.topic.starts_with("__") {
            let stall = self.state.send_stalls.lock().pop_front();
            if let Some(stall) = stall {
                std::thread::sleep(stall);
            }
        }
        self.state.messages.lock().push(SentMessage {
            topic: self.topic.clone(),
            timestamp,
            payload: Bytes::copy_from_slice(payload),
        });
        true
    }
}
