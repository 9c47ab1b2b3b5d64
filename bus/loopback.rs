// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-process bus: topic fan-out over mpsc channels.

use crate::{Bus, DataTypeInfo, Publisher};
use base::time::Time;
use base::{Error, FastHashMap, Mutex};
use bytes::Bytes;
use std::sync::mpsc;
use std::sync::Arc;

/// A message as seen by a loopback subscriber.
#[derive(Clone, Debug)]
pub struct Message {
    pub topic: String,
    pub timestamp: Time,
    pub payload: Bytes,
}

struct Inner {
    subscribers: Mutex<FastHashMap<String, Vec<mpsc::Sender<Message>>>>,
}

/// An in-process [`Bus`]: every send is fanned out to all current
/// subscribers of the topic. Subscribers that went away are pruned on the
/// next send.
#[derive(Clone)]
pub struct LoopbackBus(Arc<Inner>);

impl LoopbackBus {
    pub fn new() -> Self {
        LoopbackBus(Arc::new(Inner {
            subscribers: Mutex::new(FastHashMap::default()),
        }))
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel();
        self.0
            .subscribers
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push(tx);
        rx
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for LoopbackBus {
    fn create_publisher(
        &self,
        topic: &str,
        _info: &DataTypeInfo,
    ) -> Result<Box<dyn Publisher>, Error> {
        Ok(Box::new(LoopbackPublisher {
            topic: topic.to_owned(),
            inner: self.0.clone(),
        }))
    }
}

struct LoopbackPublisher {
    topic: String,
    inner: Arc<Inner>,
}

impl Publisher for LoopbackPublisher {
    fn topic_name(&self) -> &str {
        &self.topic
    }

    fn send(&self, payload: &[u8], timestamp: Time) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let Some(senders) = subscribers.get_mut(&self.topic) else {
            return true; // nobody listening is not a failure
        };
        let payload = Bytes::copy_from_slice(payload);
        senders.retain(|tx| {
            tx.send(Message {
                topic: self.topic.clone(),
                timestamp,
                payload: payload.clone(),
            })
            .is_ok()
        });
        true
    }
}
