// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! UDP multicast transport.
//!
//! One datagram per message: `b"TDK0"` magic, u16-LE topic length, topic
//! bytes, i64-LE timestamp in microseconds, payload. All publishers of one
//! [`UdpBus`] share a single unconnected socket.

use crate::{Bus, DataTypeInfo, Publisher};
use base::time::Time;
use base::{bail, err, Error, ResultExt};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 4, 2), 14302);

pub const MAGIC: &[u8; 4] = b"TDK0";

/// Keeps the datagram under the common 64 KiB UDP limit with headroom for
/// the frame header.
const MAX_PAYLOAD: usize = 60 * 1024;

struct Inner {
    socket: UdpSocket,
    dest: SocketAddrV4,
}

/// A [`Bus`] publishing every message as one multicast datagram.
#[derive(Clone)]
pub struct UdpBus(Arc<Inner>);

impl UdpBus {
    pub fn new(group: SocketAddrV4, ttl: u32) -> Result<Self, Error> {
        if !group.ip().is_multicast() {
            bail!(InvalidArgument, msg("{} is not a multicast group", group.ip()));
        }
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .err_kind(base::ErrorKind::Unavailable)?;
        socket
            .bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
            .err_kind(base::ErrorKind::Unavailable)?;
        socket
            .set_multicast_ttl_v4(ttl)
            .err_kind(base::ErrorKind::Unavailable)?;
        // Processes on this host (subscribers, tooling) see the traffic too.
        socket
            .set_multicast_loop_v4(true)
            .err_kind(base::ErrorKind::Unavailable)?;
        Ok(UdpBus(Arc::new(Inner {
            socket: socket.into(),
            dest: group,
        })))
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.0.dest
    }
}

impl Bus for UdpBus {
    fn create_publisher(
        &self,
        topic: &str,
        _info: &DataTypeInfo,
    ) -> Result<Box<dyn Publisher>, Error> {
        if topic.len() > usize::from(u16::MAX) {
            return Err(err!(InvalidArgument, msg("topic name too long: {topic:?}")));
        }
        let mut header = Vec::with_capacity(MAGIC.len() + 2 + topic.len());
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&(topic.len() as u16).to_le_bytes());
        header.extend_from_slice(topic.as_bytes());
        Ok(Box::new(UdpPublisher {
            topic: topic.to_owned(),
            header,
            oversize_warned: AtomicBool::new(false),
            inner: self.0.clone(),
        }))
    }
}

struct UdpPublisher {
    topic: String,
    /// Precomputed magic + topic prefix of every datagram.
    header: Vec<u8>,
    oversize_warned: AtomicBool,
    inner: Arc<Inner>,
}

impl Publisher for UdpPublisher {
    fn topic_name(&self) -> &str {
        &self.topic
    }

    fn send(&self, payload: &[u8], timestamp: Time) -> bool {
        if payload.len() > MAX_PAYLOAD {
            if !self.oversize_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    topic = %self.topic,
                    len = payload.len(),
                    "dropping oversized message (limit {MAX_PAYLOAD}); \
                     further drops on this topic will not be logged"
                );
            }
            return false;
        }
        let mut datagram = Vec::with_capacity(self.header.len() + 8 + payload.len());
        datagram.extend_from_slice(&self.header);
        datagram.extend_from_slice(&timestamp.0.to_le_bytes());
        datagram.extend_from_slice(payload);
        match self.inner.socket.send_to(&datagram, self.inner.dest) {
            Ok(_) => true,
            Err(err) => {
                warn!(topic = %self.topic, %err, "udp send failed");
                false
            }
        }
    }
}
