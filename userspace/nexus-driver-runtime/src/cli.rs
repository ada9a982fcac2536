// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host CLI: usage, readiness report and an end-to-end self-test.

use std::time::{Duration, Instant};

use crate::{
    Arena, Channel, Dispatcher, DispatcherOptions, DriverId, Result, Runtime, RuntimeConfig,
    StartOptions, Status,
};

/// Returns the CLI usage string for the driver runtime.
pub fn help() -> &'static str {
    "nexus-drt hosts the driver runtime. Usage: nexus-drt [--help] [--config <path>] [--selftest]"
}

/// Executes the CLI using provided arguments.
pub fn execute(args: &[&str]) -> String {
    if args.iter().any(|arg| *arg == "--help") {
        return help().to_string();
    }
    let config = match args.iter().position(|arg| *arg == "--config") {
        Some(index) => match args.get(index + 1) {
            Some(path) => match RuntimeConfig::from_path(path) {
                Ok(config) => config,
                Err(err) => return format!("error: {err}"),
            },
            None => return "error: --config needs a path".to_string(),
        },
        None => RuntimeConfig::default(),
    };
    if args.iter().any(|arg| *arg == "--selftest") {
        return match selftest(config) {
            Ok(elapsed) => format!("selftest ok: echo round trip in {} us", elapsed.as_micros()),
            Err(err) => format!("selftest failed: {err}"),
        };
    }
    format!("driver runtime ready (max_threads={})", config.max_threads)
}

/// Parses `std::env::args` and prints the execution result.
pub fn run() {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    println!("{}", execute(&refs));
}

fn serve_echo(dispatcher: &Dispatcher, channel: Channel) -> Result<()> {
    let endpoint = channel.clone();
    channel.wait_async(dispatcher, 0, move |dispatcher, status| {
        if status.is_err() {
            return;
        }
        if let Ok(message) = endpoint.read(0) {
            let (arena, data, _) = message.into_parts();
            if let Err(err) = endpoint.write(0, arena.as_ref(), data, Vec::new()) {
                log::warn!("selftest: echo write failed: {err}");
            }
        }
        if let Err(err) = serve_echo(dispatcher, endpoint) {
            log::debug!("selftest: echo stopped: {err}");
        }
    })
}

fn selftest(config: RuntimeConfig) -> Result<Duration> {
    let runtime = Runtime::new(config);
    runtime.start(StartOptions::empty())?;
    let server = runtime.create_dispatcher_with_owner(
        DriverId::new(),
        DispatcherOptions::empty(),
        "selftest-server",
        "",
        |_| {},
    )?;
    let client = runtime.create_dispatcher_with_owner(
        DriverId::new(),
        DispatcherOptions::ALLOW_SYNC_CALLS,
        "selftest-client",
        "",
        |_| {},
    )?;
    let (near, far) = Channel::create(0)?;
    serve_echo(&server, far)?;

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    client.post_task(move |_, status| {
        let outcome = status.and_then(|()| {
            let arena = Arena::new(0x5354);
            let data = arena.copy_from(b"txid:ping")?;
            let started = Instant::now();
            let reply = near.call(0, Some(started + Duration::from_secs(1)), &arena, data, Vec::new())?;
            if reply.bytes()[4..] != *b":ping" {
                return Err(Status::Internal);
            }
            Ok(started.elapsed())
        });
        let _ = done_tx.send(outcome);
    })?;
    let outcome = done_rx.recv_timeout(Duration::from_secs(5)).map_err(|_| Status::TimedOut)?;
    runtime.destroy_all_dispatchers()?;
    outcome
}
