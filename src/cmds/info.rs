// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::time::Time;
use base::Error;
use bpaf::Bpaf;
use meas::{MeasurementBackend, MeasurementContainer};
use std::path::PathBuf;
use std::sync::Arc;

/// Prints a summary of a measurement: channels, bounds, continuity.
#[derive(Bpaf, Debug)]
#[bpaf(command("info"))]
pub struct Args {
    /// Index frames by send timestamp rather than receive timestamp.
    use_send_timestamps: bool,

    /// Tape file to inspect.
    #[bpaf(positional("MEASUREMENT"))]
    measurement: PathBuf,
}

/// Relative position within the measurement, rounded to milliseconds.
fn rel_secs(timestamp: Time, first: Time) -> f64 {
    ((timestamp - first).as_secs_f64() * 1_000.0).round() / 1_000.0
}

pub fn run(args: Args) -> Result<i32, Error> {
    let backend = Arc::new(meas::file::TapeFile::open(&args.measurement)?);
    let container = MeasurementContainer::new(
        backend.clone(),
        args.measurement.clone(),
        !args.use_send_timestamps,
    )?;

    println!("Measurement: {}", args.measurement.display());
    println!("Frames:      {}", container.frame_count());
    println!("Length:      {}", container.measurement_length());
    let first = container.timestamp(0);
    if let Ok(start) = jiff::Timestamp::from_microsecond(first.0) {
        println!("Start:       {start}");
    }
    println!();
    println!(
        "{:<32} {:>8} {:>10} {:>10}  {:<16} continuity",
        "channel", "frames", "from [s]", "to [s]", "type"
    );
    let continuity = container.continuity_report();
    for channel in container.channel_names() {
        let report = &continuity[&channel];
        let continuity_text = if report.expected_frame_count < 0 {
            "n/a (multiple producers)".to_owned()
        } else if report.expected_frame_count == report.existing_frame_count {
            "complete".to_owned()
        } else {
            format!(
                "{} of {} frames",
                report.existing_frame_count, report.expected_frame_count
            )
        };
        println!(
            "{:<32} {:>8} {:>10.3} {:>10.3}  {:<16} {}",
            channel,
            report.existing_frame_count,
            rel_secs(backend.min_timestamp(&channel), first),
            rel_secs(backend.max_timestamp(&channel), first),
            container.data_type_info(&channel).name,
            continuity_text,
        );
    }
    Ok(0)
}
