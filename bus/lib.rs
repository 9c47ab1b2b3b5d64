// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The publish side of the bus, as the player sees it.
//!
//! The engine never talks to a transport directly; it asks a [`Bus`] for one
//! [`Publisher`] per topic and pushes payloads through it. The shipped
//! transports are a UDP multicast sender ([`udp::UdpBus`]) and an in-process
//! loopback ([`loopback::LoopbackBus`]) for tests and local tooling.

pub mod loopback;
pub mod udp;

use base::time::Time;
use base::Error;

/// Describes the payload type carried by a topic, as recorded.
///
/// The bus itself does not interpret payloads; this travels along so that
/// subscribers can.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DataTypeInfo {
    pub name: String,
    pub encoding: String,
    pub descriptor: Vec<u8>,
}

/// An endpoint for one topic.
pub trait Publisher: Send + Sync {
    /// The topic this publisher was created for (possibly a remapped name,
    /// not necessarily the recorded channel name).
    fn topic_name(&self) -> &str;

    /// Publishes one message stamped with the given measurement timestamp.
    ///
    /// Returns false if the message could not be sent; the failure is logged
    /// by the transport and must not stop the caller.
    fn send(&self, payload: &[u8], timestamp: Time) -> bool;
}

/// A handle to the bus, able to mint [`Publisher`]s.
pub trait Bus: Send + Sync {
    fn create_publisher(
        &self,
        topic: &str,
        info: &DataTypeInfo,
    ) -> Result<Box<dyn Publisher>, Error>;
}
