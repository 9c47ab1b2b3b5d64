// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Reader for the single-file tape container.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! magic       [u8; 8]  b"TAPEDECK"
//! version     u32      currently 1
//! channels    u32
//! per channel:
//!   name        u16 length + bytes (UTF-8)
//!   type name   u16 length + bytes
//!   encoding    u16 length + bytes
//!   descriptor  u32 length + bytes
//!   entries     u64
//!   per entry:
//!     id, send µs, receive µs, send id, send clock   i64 each
//!     blob offset, blob length                       u64 each
//! blob heap   (absolute offsets)
//! ```
//!
//! The index is held in memory after open; blobs are read on demand through
//! a shared file handle.

use crate::{EntryInfo, MeasurementBackend};
use base::time::Time;
use base::{bail, err, Error, ErrorKind, FastHashMap, Mutex, ResultExt};
use byteorder::{ReadBytesExt, LE};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

pub const MAGIC: &[u8; 8] = b"TAPEDECK";
pub const VERSION: u32 = 1;

/// Caps for index sanity checks; a valid file never comes close.
const MAX_CHANNELS: u32 = 1 << 16;
const MAX_ENTRIES_PER_CHANNEL: u64 = 1 << 32;

struct TapeChannel {
    info: bus::DataTypeInfo,
    entries: Vec<EntryInfo>,
}

/// An open tape file.
pub struct TapeFile {
    channels: BTreeMap<String, TapeChannel>,
    blobs: FastHashMap<i64, (u64, u64)>,
    file: Mutex<File>,
}

fn read_short_string<R: Read>(r: &mut R, what: &str) -> Result<String, Error> {
    let len = r.read_u16::<LE>().err_kind(ErrorKind::DataLoss)?;
    let mut buf = vec![0u8; usize::from(len)];
    r.read_exact(&mut buf).err_kind(ErrorKind::DataLoss)?;
    String::from_utf8(buf)
        .map_err(|_| err!(DataLoss, msg("{what} is not valid UTF-8")))
}

fn read_blob_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, Error> {
    let len = r.read_u32::<LE>().err_kind(ErrorKind::DataLoss)?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).err_kind(ErrorKind::DataLoss)?;
    Ok(buf)
}

impl TapeFile {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Unavailable
            };
            Error::new(
                kind,
                Some(format!("unable to open {}", path.display())),
                Some(Box::new(e)),
            )
        })?;
        let file_len = file
            .metadata()
            .err_kind(ErrorKind::Unavailable)?
            .len();
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).err_kind(ErrorKind::DataLoss)?;
        if &magic != MAGIC {
            bail!(InvalidArgument, msg("{} is not a tape file", path.display()));
        }
        let version = r.read_u32::<LE>().err_kind(ErrorKind::DataLoss)?;
        if version != VERSION {
            bail!(
                Unimplemented,
                msg("unsupported tape version {version} (expected {VERSION})")
            );
        }

        let channel_count = r.read_u32::<LE>().err_kind(ErrorKind::DataLoss)?;
        if channel_count > MAX_CHANNELS {
            bail!(DataLoss, msg("implausible channel count {channel_count}"));
        }
        let mut channels = BTreeMap::new();
        let mut blobs = FastHashMap::default();
        for _ in 0..channel_count {
            let name = read_short_string(&mut r, "channel name")?;
            let type_name = read_short_string(&mut r, "type name")?;
            let encoding = read_short_string(&mut r, "encoding")?;
            let descriptor = read_blob_bytes(&mut r)?;
            let entry_count = r.read_u64::<LE>().err_kind(ErrorKind::DataLoss)?;
            if entry_count > MAX_ENTRIES_PER_CHANNEL {
                bail!(
                    DataLoss,
                    msg("implausible entry count {entry_count} on channel {name:?}")
                );
            }
            let mut entries = Vec::with_capacity(entry_count as usize);
            for _ in 0..entry_count {
                let id = r.read_i64::<LE>().err_kind(ErrorKind::DataLoss)?;
                let send_timestamp = Time(r.read_i64::<LE>().err_kind(ErrorKind::DataLoss)?);
                let receive_timestamp = Time(r.read_i64::<LE>().err_kind(ErrorKind::DataLoss)?);
                let send_id = r.read_i64::<LE>().err_kind(ErrorKind::DataLoss)?;
                let send_clock = r.read_i64::<LE>().err_kind(ErrorKind::DataLoss)?;
                let blob_offset = r.read_u64::<LE>().err_kind(ErrorKind::DataLoss)?;
                let blob_len = r.read_u64::<LE>().err_kind(ErrorKind::DataLoss)?;
                match blob_offset.checked_add(blob_len) {
                    Some(end) if end <= file_len => {}
                    _ => bail!(
                        DataLoss,
                        msg("entry {id} blob [{blob_offset}, +{blob_len}) outside file")
                    ),
                }
                if blobs.insert(id, (blob_offset, blob_len)).is_some() {
                    bail!(DataLoss, msg("duplicate entry id {id}"));
                }
                entries.push(EntryInfo {
                    id,
                    send_timestamp,
                    receive_timestamp,
                    send_id,
                    send_clock,
                });
            }
            if channels
                .insert(
                    name.clone(),
                    TapeChannel {
                        info: bus::DataTypeInfo {
                            name: type_name,
                            encoding,
                            descriptor,
                        },
                        entries,
                    },
                )
                .is_some()
            {
                bail!(DataLoss, msg("duplicate channel {name:?}"));
            }
        }

        Ok(TapeFile {
            channels,
            blobs,
            file: Mutex::new(r.into_inner()),
        })
    }
}

impl MeasurementBackend for TapeFile {
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
        let (_, len) = self
            .blobs
            .get(&id)
            .ok_or_else(|| err!(NotFound, msg("no entry with id {id}")))?;
        Ok(*len as usize)
    }

    fn read_entry_data(&self, id: i64, buf: &mut [u8]) -> Result<(), Error> {
        let (offset, len) = *self
            .blobs
            .get(&id)
            .ok_or_else(|| err!(NotFound, msg("no entry with id {id}")))?;
        if buf.len() != len as usize {
            return Err(err!(
                InvalidArgument,
                msg("buffer is {} bytes, blob is {len}", buf.len())
            ));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .err_kind(ErrorKind::Unavailable)?;
        file.read_exact(buf).err_kind(ErrorKind::Unavailable)?;
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
pub(crate) mod testutil {
    use byteorder::{WriteBytesExt, LE};
    use std::io::Write;

    pub struct FixtureChannel {
        pub name: &'static str,
        pub type_name: &'static str,
        pub encoding: &'static str,
        /// (id, send µs, receive µs, send id, send clock, payload)
        pub entries: Vec<(i64, i64, i64, i64, i64, Vec<u8>)>,
    }

    /// Serializes channels into a tape-file byte image.
    pub fn build_tape(channels: &[FixtureChannel]) -> Vec<u8> {
        let mut index = Vec::new();
        index.write_all(super::MAGIC).unwrap();
        index.write_u32::<LE>(super::VERSION).unwrap();
        index.write_u32::<LE>(channels.len() as u32).unwrap();

        // Two passes: sizes first so blob offsets are known up front.
        let mut index_len = index.len();
        for c in channels {
            index_len += 2 + c.name.len() + 2 + c.type_name.len() + 2 + c.encoding.len() + 4 + 8;
            index_len += c.entries.len() * (5 * 8 + 2 * 8);
        }
        let mut heap = Vec::new();
        for c in channels {
            index.write_u16::<LE>(c.name.len() as u16).unwrap();
            index.write_all(c.name.as_bytes()).unwrap();
            index.write_u16::<LE>(c.type_name.len() as u16).unwrap();
            index.write_all(c.type_name.as_bytes()).unwrap();
            index.write_u16::<LE>(c.encoding.len() as u16).unwrap();
            index.write_all(c.encoding.as_bytes()).unwrap();
            index.write_u32::<LE>(0).unwrap(); // empty descriptor
            index.write_u64::<LE>(c.entries.len() as u64).unwrap();
            for (id, send, recv, send_id, send_clock, payload) in &c.entries {
                index.write_i64::<LE>(*id).unwrap();
                index.write_i64::<LE>(*send).unwrap();
                index.write_i64::<LE>(*recv).unwrap();
                index.write_i64::<LE>(*send_id).unwrap();
                index.write_i64::<LE>(*send_clock).unwrap();
                index
                    .write_u64::<LE>((index_len + heap.len()) as u64)
                    .unwrap();
                index.write_u64::<LE>(payload.len() as u64).unwrap();
                heap.extend_from_slice(payload);
            }
        }
        assert_eq!(index.len(), index_len);
        index.extend_from_slice(&heap);
        index
    }
}
