// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The unified, time-sorted frame index over one measurement backend.
//!
//! The container is replaced wholesale when a new measurement is loaded. It
//! owns the publisher arena and the send buffer; frames refer to publishers
//! by arena index, so dropping the arena detaches every frame at once.

use crate::MeasurementBackend;
use base::time::{Duration, Time};
use base::{bail, Error, FastHashMap, Mutex};
use itertools::Itertools as _;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Initial send buffer size; grown on demand for larger blobs.
const MIN_SEND_BUFFER_SIZE: usize = 10 << 20;

/// Frame count health of one channel.
///
/// `expected_frame_count` is derived from the producer's send clock and is
/// `-1` when entries interleave multiple producers (undetectable).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContinuityReport {
    pub expected_frame_count: i64,
    pub existing_frame_count: i64,
}

struct ChannelEntry {
    name: String,
    info: bus::DataTypeInfo,
}

/// One row of the frame index. Immutable after load except for the
/// publisher assignment.
struct Frame {
    id: i64,
    channel: u32,
    send_timestamp: Time,
    receive_timestamp: Time,
    #[allow(dead_code)] // recorded producer tag, surfaced to future tooling
    send_id: i64,
    send_clock: i64,
    /// Index into the publisher arena; `None` means "do not publish".
    publisher: Option<u32>,
}

struct PublisherSlot {
    channel: u32,
    publisher: Box<dyn bus::Publisher>,
    message_counter: AtomicI64,
}

pub struct MeasurementContainer {
    backend: Arc<dyn MeasurementBackend>,
    path: PathBuf,
    use_receive_timestamp: bool,
    channels: Vec<ChannelEntry>,
    frames: Vec<Frame>,
    /// `Some` iff publishers are initialized (possibly with zero slots).
    publishers: Option<Vec<PublisherSlot>>,
    send_buffer: Mutex<Vec<u8>>,
}

impl MeasurementContainer {
    /// Builds the frame index: every entry of every channel, sorted
    /// ascending by the chosen timestamp. The choice of send vs. receive
    /// time is fixed for the container's lifetime.
    pub fn new(
        backend: Arc<dyn MeasurementBackend>,
        path: PathBuf,
        use_receive_timestamp: bool,
    ) -> Result<Self, Error> {
        let mut channels = Vec::new();
        let mut frames = Vec::new();
        for name in backend.channels() {
            let info = backend.data_type_info(&name);
            let channel = channels.len() as u32;
            for entry in backend.entries_info(&name)? {
                frames.push(Frame {
                    id: entry.id,
                    channel,
                    send_timestamp: entry.send_timestamp,
                    receive_timestamp: entry.receive_timestamp,
                    send_id: entry.send_id,
                    send_clock: entry.send_clock,
                    publisher: None,
                });
            }
            channels.push(ChannelEntry { name, info });
        }
        if use_receive_timestamp {
            frames.sort_by_key(|f| f.receive_timestamp);
        } else {
            frames.sort_by_key(|f| f.send_timestamp);
        }
        Ok(MeasurementContainer {
            backend,
            path,
            use_receive_timestamp,
            channels,
            frames,
            publishers: None,
            send_buffer: Mutex::new(vec![0; MIN_SEND_BUFFER_SIZE]),
        })
    }

    fn chosen(&self, frame: &Frame) -> Time {
        if self.use_receive_timestamp {
            frame.receive_timestamp
        } else {
            frame.send_timestamp
        }
    }

    pub fn frame_count(&self) -> i64 {
        self.frames.len() as i64
    }

    pub fn is_using_receive_timestamp(&self) -> bool {
        self.use_receive_timestamp
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The chosen timestamp of the frame, or 0 if out of range.
    pub fn timestamp(&self, index: i64) -> Time {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.frames.get(i))
            .map(|f| self.chosen(f))
            .unwrap_or_default()
    }

    pub fn channel_name(&self, index: i64) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.frames.get(i))
            .map(|f| self.channels[f.channel as usize].name.as_str())
    }

    pub fn channel_names(&self) -> BTreeSet<String> {
        self.backend.channels()
    }

    pub fn measurement_length(&self) -> Duration {
        self.timestamp(self.frame_count() - 1) - self.timestamp(0)
    }

    pub fn min_timestamp_of_channel(&self, channel: &str) -> Time {
        self.backend.min_timestamp(channel)
    }

    pub fn max_timestamp_of_channel(&self, channel: &str) -> Time {
        self.backend.max_timestamp(channel)
    }

    pub fn data_type_info(&self, channel: &str) -> bus::DataTypeInfo {
        self.backend.data_type_info(channel)
    }

    /// Creates one publisher per channel, identity-mapped.
    pub fn create_publishers(&mut self, on: &dyn bus::Bus) -> Result<(), Error> {
        let mapping = self
            .channel_names()
            .into_iter()
            .map(|c| (c.clone(), c))
            .collect();
        self.create_publishers_with(on, &mapping)
    }

    /// Creates publishers for the listed source channels, announced under
    /// the mapping's target names. Frames of unlisted channels stay
    /// non-publishable. Re-initializing resets the message counters.
    pub fn create_publishers_with(
        &mut self,
        on: &dyn bus::Bus,
        mapping: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.deinit_publishers();

        let mut slots = Vec::new();
        let mut slot_by_channel: FastHashMap<u32, u32> = FastHashMap::default();
        for (source, target) in mapping {
            let Some(channel) = self
                .channels
                .iter()
                .position(|c| &c.name == source)
            else {
                warn!("channel mapping source {source:?} is not in the measurement");
                continue;
            };
            let channel = channel as u32;
            let publisher = on.create_publisher(target, &self.channels[channel as usize].info)?;
            slot_by_channel.insert(channel, slots.len() as u32);
            slots.push(PublisherSlot {
                channel,
                publisher,
                message_counter: AtomicI64::new(0),
            });
        }
        if slots.is_empty() && !mapping.is_empty() {
            bail!(
                InvalidArgument,
                msg("channel mapping matches no recorded channel")
            );
        }

        for frame in &mut self.frames {
            frame.publisher = slot_by_channel.get(&frame.channel).copied();
        }
        self.publishers = Some(slots);
        Ok(())
    }

    /// Drops all publisher handles and counters. Frames keep their index
    /// positions but become non-publishable.
    pub fn deinit_publishers(&mut self) {
        self.publishers = None;
        for frame in &mut self.frames {
            frame.publisher = None;
        }
    }

    pub fn publishers_created(&self) -> bool {
        self.publishers.is_some()
    }

    /// Active `{source channel → bus topic}` mapping.
    pub fn channel_mapping(&self) -> BTreeMap<String, String> {
        let Some(publishers) = &self.publishers else {
            return BTreeMap::new();
        };
        publishers
            .iter()
            .map(|s| {
                (
                    self.channels[s.channel as usize].name.clone(),
                    s.publisher.topic_name().to_owned(),
                )
            })
            .collect()
    }

    /// Successful publishes per channel since the last (re-)initialization.
    pub fn message_counters(&self) -> BTreeMap<String, i64> {
        let Some(publishers) = &self.publishers else {
            return BTreeMap::new();
        };
        publishers
            .iter()
            .map(|s| {
                (
                    self.channels[s.channel as usize].name.clone(),
                    s.message_counter.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    /// Loads and publishes the frame at `index`.
    ///
    /// No-op returning false if the index is out of range, publishers are
    /// not initialized, the frame's channel has no publisher, or the load
    /// fails. A false return must not stop playback.
    pub fn publish_frame(&self, index: i64) -> bool {
        let Some(publishers) = &self.publishers else {
            return false;
        };
        let Some(frame) = usize::try_from(index).ok().and_then(|i| self.frames.get(i)) else {
            return false;
        };
        let Some(slot) = frame.publisher else {
            return false;
        };
        let slot = &publishers[slot as usize];

        let size = match self.backend.entry_data_size(frame.id) {
            Ok(size) => size,
            Err(err) => {
                warn!(id = frame.id, err = %err.chain(), "cannot size frame");
                return false;
            }
        };
        let mut buffer = self.send_buffer.lock();
        if buffer.len() < size {
            let additional = size - buffer.len();
            if buffer.try_reserve(additional).is_err() {
                warn!(size, "send buffer growth failed, skipping frame");
                return false;
            }
            buffer.resize(size, 0);
        }
        if let Err(err) = self.backend.read_entry_data(frame.id, &mut buffer[..size]) {
            warn!(id = frame.id, err = %err.chain(), "cannot load frame");
            return false;
        }
        if !slot.publisher.send(&buffer[..size], self.chosen(frame)) {
            return false;
        }
        slot.message_counter.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// The smallest index `> current` with a publisher, within `limit`.
    /// With `repeat`, wraps around to `[limit.0, min(current, limit.1)]`.
    /// -1 if nothing qualifies.
    pub fn next_enabled_index(&self, current: i64, repeat: bool, limit: (i64, i64)) -> i64 {
        if self.publishers.is_none() {
            return -1;
        }
        self.scan(current, repeat, limit, |f| f.publisher.is_some())
    }

    /// Like [`Self::next_enabled_index`], but matching by channel name
    /// rather than publisher assignment.
    pub fn next_occurrence_of_channel(
        &self,
        current: i64,
        source_channel_name: &str,
        repeat: bool,
        limit: (i64, i64),
    ) -> i64 {
        let Some(channel) = self
            .channels
            .iter()
            .position(|c| c.name == source_channel_name)
        else {
            return -1;
        };
        let channel = channel as u32;
        self.scan(current, repeat, limit, |f| f.channel == channel)
    }

    fn scan<F: Fn(&Frame) -> bool>(
        &self,
        current: i64,
        repeat: bool,
        limit: (i64, i64),
        matches: F,
    ) -> i64 {
        let last = self.frame_count() - 1;
        let mut i = std::cmp::max(current + 1, limit.0);
        while i <= std::cmp::min(limit.1, last) {
            if matches(&self.frames[i as usize]) {
                return i;
            }
            i += 1;
        }
        if repeat {
            let mut i = std::cmp::max(0, limit.0);
            while i <= std::cmp::min(std::cmp::min(current, limit.1), last) {
                if matches(&self.frames[i as usize]) {
                    return i;
                }
                i += 1;
            }
        }
        -1
    }

    /// Index of the frame closest to `timestamp`, clamped to the
    /// measurement; ties resolve toward the earlier frame. -1 when empty.
    pub fn nearest_index(&self, timestamp: Time) -> i64 {
        if self.frames.is_empty() {
            return -1;
        }
        let i = self
            .frames
            .partition_point(|f| self.chosen(f) < timestamp);
        if i == 0 {
            return 0;
        }
        if i == self.frames.len() {
            return (self.frames.len() - 1) as i64;
        }
        let before = self.chosen(&self.frames[i - 1]);
        let after = self.chosen(&self.frames[i]);
        if timestamp - before <= after - timestamp {
            (i - 1) as i64
        } else {
            i as i64
        }
    }

    /// Playback time from `first` to `second`; when `second < first`, the
    /// wrap across the measurement end is accounted for.
    pub fn time_between(&self, first: i64, second: i64) -> Duration {
        if second >= first {
            self.timestamp(second) - self.timestamp(first)
        } else {
            (self.timestamp(self.frame_count() - 1) - self.timestamp(second))
                + (self.timestamp(first) - self.timestamp(0))
        }
    }

    /// Expected vs. existing frame counts per channel.
    ///
    /// Entries are examined in their natural backend order, not the unified
    /// time order: the send clock of a single producer increases in write
    /// order even when receive timestamps interleave.
    pub fn continuity_report(&self) -> BTreeMap<String, ContinuityReport> {
        let mut report = BTreeMap::new();
        for name in self.backend.channels() {
            let entries = match self.backend.entries_info(&name) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(channel = %name, err = %err.chain(), "skipping in continuity report");
                    continue;
                }
            };
            let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
                report.insert(
                    name,
                    ContinuityReport {
                        expected_frame_count: 0,
                        existing_frame_count: 0,
                    },
                );
                continue;
            };
            let single_source = entries
                .iter()
                .tuple_windows()
                .all(|(a, b)| b.send_clock > a.send_clock);
            report.insert(
                name,
                ContinuityReport {
                    expected_frame_count: if single_source {
                        last.send_clock - first.send_clock + 1
                    } else {
                        -1
                    },
                    existing_frame_count: entries.len() as i64,
                },
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::MeasurementContainer;
    use crate::mem::MemBackend;
    use crate::EntryInfo;
    use base::time::{Duration, Time};
    use bus::loopback::LoopbackBus;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn millis(ms: i64) -> Time {
        Time(ms * 1_000)
    }

    /// Channels `a` (0, 20, 40 ms) and `b` (10, 30 ms).
    fn two_channel_container() -> MeasurementContainer {
        let backend = MemBackend::builder()
            .entry("a", millis(0), b"a0")
            .entry("a", millis(20), b"a1")
            .entry("a", millis(40), b"a2")
            .entry("b", millis(10), b"b0")
            .entry("b", millis(30), b"b1")
            .build();
        MeasurementContainer::new(Arc::new(backend), PathBuf::from("/tmp/meas"), true).unwrap()
    }

    #[test]
    fn frame_table_is_time_sorted_across_channels() {
        let c = two_channel_container();
        assert_eq!(c.frame_count(), 5);
        let names: Vec<_> = (0..5).map(|i| c.channel_name(i).unwrap().to_owned()).collect();
        assert_eq!(names, ["a", "b", "a", "b", "a"]);
        for i in 0..4 {
            assert!(c.timestamp(i) <= c.timestamp(i + 1));
        }
        assert_eq!(c.measurement_length(), Duration::from_millis(40));
        // Out-of-range lookups clamp to zero rather than failing.
        assert_eq!(c.timestamp(-1), Time(0));
        assert_eq!(c.timestamp(5), Time(0));
        assert_eq!(c.channel_name(5), None);
    }

    #[test]
    fn send_timestamp_ordering_is_a_construction_choice() {
        let backend = MemBackend::builder()
            .entry_full(
                "x",
                EntryInfo {
                    id: 0,
                    send_timestamp: millis(5),
                    receive_timestamp: millis(100),
                    send_id: 0,
                    send_clock: 0,
                },
                b"late delivery",
            )
            .entry_full(
                "y",
                EntryInfo {
                    id: 0,
                    send_timestamp: millis(10),
                    receive_timestamp: millis(20),
                    send_id: 0,
                    send_clock: 0,
                },
                b"quick delivery",
            )
            .build();
        let by_send =
            MeasurementContainer::new(Arc::new(backend), PathBuf::new(), false).unwrap();
        assert_eq!(by_send.channel_name(0), Some("x"));
        assert_eq!(by_send.timestamp(0), millis(5));
    }

    #[test]
    fn publish_requires_initialized_enabled_frame() {
        let bus = LoopbackBus::new();
        let rx = bus.subscribe("a");
        let mut c = two_channel_container();

        assert!(!c.publish_frame(0)); // not initialized
        let mapping: BTreeMap<_, _> = [("a".to_owned(), "a".to_owned())].into();
        c.create_publishers_with(&bus, &mapping).unwrap();
        assert!(c.publish_frame(0));
        assert!(!c.publish_frame(1)); // "b" has no publisher
        assert!(!c.publish_frame(99)); // out of range
        let m = rx.try_recv().unwrap();
        assert_eq!(&m.payload[..], b"a0");
        assert_eq!(m.timestamp, millis(0));
        assert_eq!(c.message_counters(), BTreeMap::from([("a".to_owned(), 1)]));

        // Re-initialization resets counters; deinit forgets them.
        c.create_publishers_with(&bus, &mapping).unwrap();
        assert_eq!(c.message_counters(), BTreeMap::from([("a".to_owned(), 0)]));
        c.deinit_publishers();
        assert!(!c.publish_frame(0));
        assert!(c.message_counters().is_empty());
    }

    #[test]
    fn mapping_renames_topic_and_rejects_unknown_only_mappings() {
        let bus = LoopbackBus::new();
        let rx = bus.subscribe("vehicle/a");
        let mut c = two_channel_container();
        let mapping: BTreeMap<_, _> = [
            ("a".to_owned(), "vehicle/a".to_owned()),
            ("ghost".to_owned(), "vehicle/ghost".to_owned()),
        ]
        .into();
        c.create_publishers_with(&bus, &mapping).unwrap();
        assert_eq!(
            c.channel_mapping(),
            BTreeMap::from([("a".to_owned(), "vehicle/a".to_owned())])
        );
        assert!(c.publish_frame(0));
        assert_eq!(rx.try_recv().unwrap().topic, "vehicle/a");

        let unknown_only: BTreeMap<_, _> =
            [("ghost".to_owned(), "vehicle/ghost".to_owned())].into();
        assert!(c.create_publishers_with(&bus, &unknown_only).is_err());
        assert!(!c.publishers_created());
    }

    #[test]
    fn next_enabled_index_respects_limits_and_wraps() {
        let bus = LoopbackBus::new();
        let mut c = two_channel_container();
        c.create_publishers(&bus).unwrap();

        assert_eq!(c.next_enabled_index(0, false, (0, 4)), 1);
        assert_eq!(c.next_enabled_index(4, false, (0, 4)), -1);
        assert_eq!(c.next_enabled_index(4, true, (0, 4)), 0);
        assert_eq!(c.next_enabled_index(3, true, (1, 3)), 1);
        assert_eq!(c.next_enabled_index(-1, false, (0, 4)), 0);

        // Only `a` enabled: 1 and 3 (channel b) are skipped.
        let mapping: BTreeMap<_, _> = [("a".to_owned(), "a".to_owned())].into();
        c.create_publishers_with(&bus, &mapping).unwrap();
        assert_eq!(c.next_enabled_index(0, false, (0, 4)), 2);
        assert_eq!(c.next_enabled_index(2, false, (0, 4)), 4);
        assert_eq!(c.next_enabled_index(4, true, (0, 4)), 0);

        c.deinit_publishers();
        assert_eq!(c.next_enabled_index(0, true, (0, 4)), -1);
    }

    #[test]
    fn next_occurrence_matches_by_channel_not_publisher() {
        let c = two_channel_container(); // publishers never initialized
        assert_eq!(c.next_occurrence_of_channel(0, "b", false, (0, 4)), 1);
        assert_eq!(c.next_occurrence_of_channel(1, "b", false, (0, 4)), 3);
        assert_eq!(c.next_occurrence_of_channel(3, "b", false, (0, 4)), -1);
        assert_eq!(c.next_occurrence_of_channel(3, "b", true, (0, 4)), 1);
        assert_eq!(c.next_occurrence_of_channel(0, "nope", true, (0, 4)), -1);
    }

    #[test]
    fn nearest_index_clamps_and_prefers_earlier() {
        let c = two_channel_container(); // 0, 10, 20, 30, 40 ms
        assert_eq!(c.nearest_index(millis(-5)), 0);
        assert_eq!(c.nearest_index(millis(1_000)), 4);
        assert_eq!(c.nearest_index(millis(20)), 2);
        assert_eq!(c.nearest_index(millis(24)), 2);
        assert_eq!(c.nearest_index(millis(26)), 3);
        assert_eq!(c.nearest_index(millis(25)), 2); // tie goes to the earlier frame
    }

    #[test]
    fn time_between_accounts_for_wrap() {
        let c = two_channel_container();
        assert_eq!(c.time_between(1, 3), Duration::from_millis(20));
        assert_eq!(c.time_between(2, 2), Duration::ZERO);
        // Wrap: distance from the end of the measurement back around.
        assert_eq!(
            c.time_between(3, 1),
            (millis(40) - millis(10)) + (millis(30) - millis(0))
        );
    }

    #[test]
    fn continuity_report_flags_gaps_and_multi_producer_channels() {
        let backend = MemBackend::builder()
            // complete: clocks 0..=2
            .entry("good", millis(0), b"")
            .entry("good", millis(10), b"")
            .entry("good", millis(20), b"")
            // gap: clocks 0, 5
            .entry_full(
                "gappy",
                EntryInfo {
                    id: 0,
                    send_timestamp: millis(0),
                    receive_timestamp: millis(0),
                    send_id: 1,
                    send_clock: 0,
                },
                b"",
            )
            .entry_full(
                "gappy",
                EntryInfo {
                    id: 0,
                    send_timestamp: millis(50),
                    receive_timestamp: millis(50),
                    send_id: 1,
                    send_clock: 5,
                },
                b"",
            )
            // two producers: clocks not strictly increasing
            .entry_full(
                "multi",
                EntryInfo {
                    id: 0,
                    send_timestamp: millis(0),
                    receive_timestamp: millis(0),
                    send_id: 1,
                    send_clock: 3,
                },
                b"",
            )
            .entry_full(
                "multi",
                EntryInfo {
                    id: 0,
                    send_timestamp: millis(1),
                    receive_timestamp: millis(1),
                    send_id: 2,
                    send_clock: 0,
                },
                b"",
            )
            .channel("empty", bus::DataTypeInfo::default())
            .build();
        let c = MeasurementContainer::new(Arc::new(backend), PathBuf::new(), true).unwrap();
        let report = c.continuity_report();
        assert_eq!(report["good"].expected_frame_count, 3);
        assert_eq!(report["good"].existing_frame_count, 3);
        assert_eq!(report["gappy"].expected_frame_count, 6);
        assert_eq!(report["gappy"].existing_frame_count, 2);
        assert_eq!(report["multi"].expected_frame_count, -1);
        assert_eq!(report["multi"].existing_frame_count, 2);
        assert_eq!(report["empty"].expected_frame_count, 0);
        assert_eq!(report["empty"].existing_frame_count, 0);
    }
}
