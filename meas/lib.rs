// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Measurement storage: backends and the time-sorted container over them.
//!
//! A *backend* is random-access storage for one recorded measurement:
//! channels, per-frame metadata, and blob retrieval by opaque id. The
//! [`container::MeasurementContainer`] builds a unified time-sorted frame
//! index across all channels of one backend and owns the publishers used to
//! replay it.

pub mod container;
pub mod file;
pub mod mem;

use base::time::Time;
use base::Error;
use std::collections::BTreeSet;

pub use container::{ContinuityReport, MeasurementContainer};

/// Per-frame metadata as stored by a backend, timestamps in microseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryInfo {
    /// Opaque handle for blob retrieval, unique within the measurement.
    pub id: i64,
    pub send_timestamp: Time,
    pub receive_timestamp: Time,
    /// Tag of the producing process.
    pub send_id: i64,
    /// Per-producer message sequence number.
    pub send_clock: i64,
}

/// Random-access storage for one recorded measurement.
///
/// `entries_info` returns entries in the backend's natural order, which is
/// not necessarily time order; the container sorts.
pub trait MeasurementBackend: Send + Sync {
    fn channels(&self) -> BTreeSet<String>;

    fn entries_info(&self, channel: &str) -> Result<Vec<EntryInfo>, Error>;

    fn data_type_info(&self, channel: &str) -> bus::DataTypeInfo;

    fn entry_data_size(&self, id: i64) -> Result<usize, Error>;

    /// Reads the blob for `id` into `buf`, which the caller has sized via
    /// [`Self::entry_data_size`].
    fn read_entry_data(&self, id: i64, buf: &mut [u8]) -> Result<(), Error>;

    /// Earliest chosen-timestamp-independent bound of the channel, in the
    /// backend's own notion (send or receive time), microseconds.
    fn min_timestamp(&self, channel: &str) -> Time;

    fn max_timestamp(&self, channel: &str) -> Time;
}
