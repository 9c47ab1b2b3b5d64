// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{err, Error};
use std::collections::BTreeMap;

pub mod info;
pub mod run;

/// Parses repeated `SOURCE=TARGET` arguments into a channel mapping; a bare
/// `SOURCE` maps to itself.
fn parse_channel_mapping(args: &[String]) -> Result<BTreeMap<String, String>, Error> {
    let mut mapping = BTreeMap::new();
    for arg in args {
        let (source, target) = match arg.split_once('=') {
            Some((source, target)) => (source, target),
            None => (arg.as_str(), arg.as_str()),
        };
        if source.is_empty() || target.is_empty() {
            return Err(err!(InvalidArgument, msg("bad channel mapping {arg:?}")));
        }
        mapping.insert(source.to_owned(), target.to_owned());
    }
    Ok(mapping)
}
