// This file is part of Tapedeck, a measurement replay engine for pub/sub middleware.
// Copyright (C) 2026 The Tapedeck Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::play::Player;
use crate::service::{Command, PlayerService, ServiceResponse};
use base::clock::Clocks;
use base::Error;
use bpaf::Bpaf;
use itertools::Itertools as _;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Loads a measurement and replays it, controlled interactively on stdin.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// UDP multicast group to publish on.
    #[bpaf(argument("ADDR"), fallback(bus::udp::DEFAULT_GROUP), display_fallback)]
    bus_addr: SocketAddrV4,

    /// Multicast TTL.
    #[bpaf(argument("TTL"), fallback(2), display_fallback)]
    bus_ttl: u32,

    /// Keep the bus in-process (dry run): snapshots are printed to stdout
    /// instead of leaving the machine.
    local: bool,

    /// Index frames by send timestamp rather than receive timestamp.
    use_send_timestamps: bool,

    /// Start playing immediately.
    play: bool,

    /// Initial play speed.
    #[bpaf(argument("FACTOR"))]
    speed: Option<f64>,

    /// Restart from the beginning when the end is reached.
    repeat: bool,

    /// Publish only these channels, optionally renamed (repeatable).
    #[bpaf(long("map"), argument("SRC[=DST]"))]
    map: Vec<String>,

    /// Tape file to load.
    #[bpaf(positional("MEASUREMENT"))]
    measurement: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let bus: Arc<dyn bus::Bus> = if args.local {
        let loopback = bus::loopback::LoopbackBus::new();
        spawn_snapshot_printer(&loopback);
        Arc::new(loopback)
    } else {
        let udp = bus::udp::UdpBus::new(args.bus_addr, args.bus_ttl)?;
        info!("publishing on multicast group {}", udp.group());
        Arc::new(udp)
    };

    let player = Arc::new(Player::new(bus)?);
    player.load_measurement(&args.measurement, !args.use_send_timestamps)?;

    if !args.map.is_empty() {
        player.initialize_publishers_with(&super::parse_channel_mapping(&args.map)?)?;
    }
    if let Some(speed) = args.speed {
        player.set_play_speed(speed);
    }
    player.set_repeat_enabled(args.repeat);

    let service = PlayerService::new(player.clone());
    if args.play {
        service.set_command(Command::Play {
            until_rel_secs: None,
        });
    }

    println!("tapedeck ready; type `help` for commands");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let output = dispatch(&service, &player, line.trim());
        if !output.is_empty() {
            println!("{output}");
        }
        if service.exit_requested() {
            break;
        }
    }
    Ok(0)
}

/// Prints every snapshot a loopback bus carries, for `--local` dry runs.
fn spawn_snapshot_printer(loopback: &bus::loopback::LoopbackBus) {
    for topic in [crate::json::STATE_TOPIC, crate::json::SIM_TIME_TOPIC] {
        let rx = loopback.subscribe(topic);
        std::thread::Builder::new()
            .name("snapshot-printer".to_owned())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    println!(
                        "{}: {}",
                        msg.topic,
                        String::from_utf8_lossy(&msg.payload)
                    );
                }
            })
            .expect("spawning the snapshot printer should succeed");
    }
}

fn response_text(response: ServiceResponse) -> String {
    match response {
        ServiceResponse::Ok => "ok".to_owned(),
        ServiceResponse::Failed(reason) => format!("failed: {reason}"),
    }
}

/// One line of the control loop. Everything goes through the same service
/// surface a remote controller would use.
fn dispatch<C: Clocks>(service: &PlayerService<C>, player: &Player<C>, line: &str) -> String {
    let words: Vec<&str> = line.split_whitespace().collect();
    let set_one = |key: &str, value: String| {
        response_text(service.set_config(&BTreeMap::from([(key.to_owned(), value)])))
    };
    match words.as_slice() {
        [] => String::new(),
        ["help"] => "\
commands:
  play [until_rel_secs]    start playback (optionally up to a position)
  pause                    pause playback
  step                     publish a single frame
  stepch CHANNEL           play until the next frame of CHANNEL
  jump REL_SECS            seek to a position (seconds from the start)
  speed FACTOR             set the play speed
  limit START_S END_S      confine playback to a relative time range
  repeat|drop|accuracy|throttle on|off
  init [SRC[=DST] ...]     create publishers (optionally a channel subset)
  deinit                   drop publishers
  state                    print the player state
  config                   print all settings
  counters                 print per-channel publish counters
  exit                     quit"
            .to_owned(),
        ["play"] => response_text(service.set_command(Command::Play {
            until_rel_secs: None,
        })),
        ["play", until] => match until.parse::<f64>() {
            Ok(rel_secs) => response_text(service.set_command(Command::Play {
                until_rel_secs: Some(rel_secs),
            })),
            Err(_) => format!("failed: bad position {until:?}"),
        },
        ["pause"] => response_text(service.set_command(Command::Pause)),
        ["step"] => response_text(service.set_command(Command::Step)),
        ["stepch", channel] => response_text(service.set_command(Command::StepChannel {
            source_channel_name: (*channel).to_owned(),
        })),
        ["jump", position] => match position.parse::<f64>() {
            Ok(rel_secs) => response_text(service.set_command(Command::JumpTo { rel_secs })),
            Err(_) => format!("failed: bad position {position:?}"),
        },
        ["speed", factor] => set_one("play_speed", (*factor).to_owned()),
        ["limit", start, end] => response_text(service.set_config(&BTreeMap::from([
            (
                "limit_interval_start_rel_secs".to_owned(),
                (*start).to_owned(),
            ),
            ("limit_interval_end_rel_secs".to_owned(), (*end).to_owned()),
        ]))),
        ["repeat", value] => set_one("repeat", (*value).to_owned()),
        ["drop", value] => set_one("frame_dropping_allowed", (*value).to_owned()),
        ["accuracy", value] => set_one("enforce_delay_accuracy", (*value).to_owned()),
        ["throttle", value] => set_one("limit_play_speed", (*value).to_owned()),
        ["init", mappings @ ..] => {
            let channel_mapping = if mappings.is_empty() {
                None
            } else {
                let mappings: Vec<String> = mappings.iter().map(|m| (*m).to_owned()).collect();
                match super::parse_channel_mapping(&mappings) {
                    Ok(mapping) => Some(mapping),
                    Err(err) => return format!("failed: {err}"),
                }
            };
            response_text(service.set_command(Command::Initialize { channel_mapping }))
        }
        ["deinit"] => response_text(service.set_command(Command::DeInitialize)),
        ["state"] => serde_json::to_string_pretty(&service.get_state())
            .unwrap_or_else(|e| format!("failed: {e}")),
        ["config"] => service
            .get_config()
            .into_iter()
            .map(|(k, v)| format!("{k} = {v}"))
            .join("\n"),
        ["counters"] => {
            let counters = player.message_counters();
            if counters.is_empty() {
                "no publishers initialized".to_owned()
            } else {
                counters
                    .into_iter()
                    .map(|(channel, count)| format!("{channel}: {count}"))
                    .join("\n")
            }
        }
        ["exit"] | ["quit"] => response_text(service.set_command(Command::Exit)),
        _ => format!("unknown command {line:?}; try `help`"),
    }
}

#[cfg(test)]
mod tests {
    use super::dispatch;
    use crate::play::Player;
    use crate::service::PlayerService;
    use crate::testutil::{self, RecordingBus};
    use base::clock::SimulatedClocks;
    use std::path::PathBuf;
    use std::sync::Arc;

    #[test]
    fn dispatch_drives_the_service() {
        testutil::init_logging();
        let bus = Arc::new(RecordingBus::new());
        let player =
            Arc::new(Player::with_clocks(bus.clone(), SimulatedClocks::new()).unwrap());
        player
            .load_backend(
                testutil::backend(&[("a", 0), ("b", 100), ("a", 200)]),
                PathBuf::from("/data/run1"),
                true,
            )
            .unwrap();
        let service = PlayerService::new(player.clone());

        assert_eq!(dispatch(&service, &player, "speed 2"), "ok");
        assert_eq!(player.play_speed(), 2.0);
        assert_eq!(
            dispatch(&service, &player, "repeat maybe"),
            "failed: cannot parse repeat value \"maybe\" as bool"
        );
        assert_eq!(dispatch(&service, &player, "repeat on"), "ok");
        assert!(player.is_repeat_enabled());
        assert_eq!(dispatch(&service, &player, "step"), "ok");
        testutil::wait_for(|| !bus.data_messages().is_empty());
        assert!(dispatch(&service, &player, "counters").contains("a: 1"));
        assert!(dispatch(&service, &player, "bogus").starts_with("unknown command"));
        assert_eq!(dispatch(&service, &player, "exit"), "ok");
        assert!(service.exit_requested());
    }
}
