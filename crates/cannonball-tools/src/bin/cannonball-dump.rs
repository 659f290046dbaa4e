//! Consumer CLI for the cannonball event stream.
//!
//! Listens on the socket the plugin connects to, decodes the
//! length-prefixed event frames, and writes one JSON line per event.
//! Start this first, then launch the emulator with the plugin; the
//! plugin blocks until the listener is up.
//!
//! # Usage
//!
//! ```bash
//! # Dump a trace to stdout
//! cannonball-dump
//!
//! # Custom socket, save to a file, stop after 1M events
//! cannonball-dump --socket /tmp/trace.sock --output trace.jsonl --max-events 1000000
//!
//! # Just count events
//! cannonball-dump --quiet
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::os::unix::net::UnixListener;
use std::process::exit;

use bytes::BytesMut;
use clap::Parser;
use log::{error, info};

use cannonball_wire::{decode_record, EventRecord};

#[derive(Parser)]
#[command(name = "cannonball-dump")]
#[command(about = "Decode a cannonball event stream to JSON lines")]
#[command(version)]
struct Cli {
    /// Socket path the plugin will connect to.
    #[arg(short, long, default_value = "/dev/shm/cannonball.sock")]
    socket: String,

    /// Write JSON lines to this file instead of stdout.
    #[arg(short, long)]
    output: Option<String>,

    /// Stop after this many events (0 = unlimited).
    #[arg(short, long, default_value = "0")]
    max_events: u64,

    /// Don't print events, only the final summary.
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    // A stale socket file from a previous run would make bind fail.
    let _ = std::fs::remove_file(&cli.socket);

    let listener = match UnixListener::bind(&cli.socket) {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind {}: {}", cli.socket, err);
            exit(1);
        }
    };

    info!("Listening on {}", cli.socket);

    let (mut conn, _) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(err) => {
            error!("Failed to accept plugin connection: {}", err);
            exit(1);
        }
    };

    info!("Plugin connected");

    let mut sink: Box<dyn Write> = match &cli.output {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(BufWriter::new(file)),
            Err(err) => {
                error!("Failed to create {}: {}", path, err);
                exit(1);
            }
        },
        None => Box::new(std::io::stdout().lock()),
    };

    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 64 * 1024];
    let mut counts: HashMap<&'static str, u64> = HashMap::new();
    let mut total: u64 = 0;

    'outer: loop {
        let n = match conn.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                error!("Read error: {}", err);
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match decode_record(&mut buf) {
                Ok(Some(record)) => {
                    if let Err(err) = emit(&mut sink, &record, cli.quiet) {
                        error!("Write error: {}", err);
                        break 'outer;
                    }
                    *counts.entry(record.kind.name()).or_insert(0) += 1;
                    total += 1;
                    if cli.max_events != 0 && total >= cli.max_events {
                        info!("Reached event limit ({})", cli.max_events);
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!("Stream corrupt, giving up: {}", err);
                    break 'outer;
                }
            }
        }
    }

    if let Err(err) = sink.flush() {
        error!("Write error: {}", err);
    }

    let mut kinds: Vec<_> = counts.into_iter().collect();
    kinds.sort();
    eprintln!("{} events", total);
    for (kind, count) in kinds {
        eprintln!("  {:<12} {}", kind, count);
    }
}

fn emit(sink: &mut dyn Write, record: &EventRecord, quiet: bool) -> std::io::Result<()> {
    if quiet {
        return Ok(());
    }
    let json = serde_json::to_string(record).map_err(std::io::Error::other)?;
    writeln!(sink, "{}", json)
}
