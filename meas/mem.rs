// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-memory measurement backend, used by tests and local tooling.

use crate::{EntryInfo, MeasurementBackend};
use base::time::Time;
use base::{err, Error, FastHashMap};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

struct MemChannel {
    info: bus::DataTypeInfo,
    entries: Vec<EntryInfo>,
}

/// A fully in-memory measurement.
pub struct MemBackend {
    channels: BTreeMap<String, MemChannel>,
    blobs: FastHashMap<i64, Vec<u8>>,
}

impl MemBackend {
    pub fn builder() -> MemBackendBuilder {
        MemBackendBuilder {
            backend: MemBackend {
                channels: BTreeMap::new(),
                blobs: FastHashMap::default(),
            },
            next_id: 0,
        }
    }
}

pub struct MemBackendBuilder {
    backend: MemBackend,
    next_id: i64,
}

impl MemBackendBuilder {
    pub fn channel(mut self, name: &str, info: bus::DataTypeInfo) -> Self {
        self.backend.channels.insert(
            name.to_owned(),
            MemChannel {
                info,
                entries: Vec::new(),
            },
        );
        self
    }

    /// Appends an entry with `send == receive == timestamp` and an
    /// auto-incremented per-channel send clock. Creates the channel with
    /// default data-type info if needed.
    pub fn entry(self, channel: &str, timestamp: Time, payload: &[u8]) -> Self {
        let clock = self
            .backend
            .channels
            .get(channel)
            .map(|c| c.entries.len() as i64)
            .unwrap_or(0);
        self.entry_full(
            channel,
            EntryInfo {
                id: 0, // assigned below
                send_timestamp: timestamp,
                receive_timestamp: timestamp,
                send_id: 0,
                send_clock: clock,
            },
            payload,
        )
    }

    /// Appends an entry with explicit metadata; the id is assigned by the
    /// builder.
    pub fn entry_full(mut self, channel: &str, mut info: EntryInfo, payload: &[u8]) -> Self {
        info.id = self.next_id;
        self.next_id += 1;
        let c = self
            .backend
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| MemChannel {
                info: bus::DataTypeInfo::default(),
                entries: Vec::new(),
            });
        c.entries.push(info);
        self.backend.blobs.insert(info.id, payload.to_vec());
        self
    }

    pub fn build(self) -> MemBackend {
        self.backend
    }
}

impl MeasurementBackend for MemBackend {
    fn channels(&self) -> BTreeSet<String> {
        self.channels.keys().cloned().collect()
    }

    fn entries_info(&self, channel: &str) -> Result<Vec<EntryInfo>, Error> {
        match self.channels.get(channel) {
            Some(c) => Ok(c.entries.clone()),
            None => Err(err!(NotFound, msg("no such channel {channel:?}"))),
        }
    }

    fn data_type_info(&self, channel: &str) -> bus::DataTypeInfo {
        self.channels
            .get(channel)
            .map(|c| c.info.clone())
            .unwrap_or_default()
    }

    fn entry_data_size(&self, id: i64) -> Result<usize, Error> {
        self.blobs
            .get(&id)
            .map(Vec::len)
            .ok_or_else(|| err!(NotFound, msg("no entry with id {id}")))
    }

    fn read_entry_data(&self, id: i64, buf: &mut [u8]) -> Result<(), Error> {
        let blob = self
            .blobs
            .get(&id)
            .ok_or_else(|| err!(NotFound, msg("no entry with id {id}")))?;
        if buf.len() != blob.len() {
            return Err(err!(
                InvalidArgument,
                msg("buffer is {} bytes, blob is {}", buf.len(), blob.len())
            ));
        }
        buf.copy_from_slice(blob);
        Ok(())
    }

    fn min_timestamp(&self, channel: &str) -> Time {
        self.channels
            .get(channel)
            .and_then(|c| c.entries.iter().map(|e| e.receive_timestamp).min())
            .unwrap_or_default()
    }

    fn max_timestamp(&self, channel: &str) -> Time {
        self.channels
            .get(channel)
            .and_then(|c| c.entries.iter().map(|e| e.receive_timestamp).max())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::MemBackend;
    use crate::MeasurementBackend;
    use base::time::Time;

    #[test]
    fn builder_assigns_ids_and_clocks() {
        let b = MemBackend::builder()
            .entry("a", Time(10), b"x")
            .entry("a", Time(20), b"yy")
            .entry("b", Time(15), b"z")
            .build();
        let a = b.entries_info("a").unwrap();
        assert_eq!(a.len(), 2);
        assert_ne!(a[0].id, a[1].id);
        assert_eq!(a[0].send_clock, 0);
        assert_eq!(a[1].send_clock, 1);
        assert_eq!(b.entry_data_size(a[1].id).unwrap(), 2);
        let mut buf = vec![0u8; 2];
        b.read_entry_data(a[1].id, &mut buf).unwrap();
        assert_eq!(&buf, b"yy");
        assert_eq!(b.min_timestamp("a"), Time(10));
        assert_eq!(b.max_timestamp("a"), Time(20));
    }
}
