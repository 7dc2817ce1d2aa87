//! Companion client: publish an MPEG-TS file to a relay, or record a
//! stream from it to disk.

use std::io::{ Read, Write };
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::{ Duration, Instant };

use anyhow::{ bail, Context };
use clap::Parser;
use tracing::info;

use srt_relay::constants::TS_DATAGRAM_LEN;
use srt_relay::logging;
use srt_relay::relay::RelayUrl;
use srt_relay::transport::{ self, Connection };

#[derive(Debug, Parser)]
#[command(name = "srt-relay-client", about = "Publish or record an SRT relay stream")]
struct ClientArgs {
    /// Relay URL, e.g. srt://127.0.0.1:4001?streamid=host/app/stream
    #[arg(short = 'r', long = "url")]
    url: String,

    /// Publish this MPEG-TS file to the relay.
    #[arg(short = 'i', long = "input", conflicts_with = "output")]
    input: Option<PathBuf>,

    /// Record the stream into this file.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Pacing bitrate for publishing, in kbit/s.
    #[arg(short = 'b', long = "bitrate", default_value_t = 4000)]
    bitrate_kbps: u64,

    /// Replay the input file in a loop.
    #[arg(long = "loop")]
    loop_input: bool,

    /// Log level.
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();
    logging::init(&args.log_level, None)?;

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let url = RelayUrl::parse(&args.url).context("relay url")?;
    let conn = transport
        ::connect(url.socket_addr()?, &url.streamid, url.latency_or(0))
        .context("connect to relay")?;
    info!(url = %url.raw, "connected");

    match (&args.input, &args.output) {
        (Some(input), None) =>
            publish(conn, input, args.bitrate_kbps, args.loop_input, &stop),
        (None, Some(output)) => record(conn, output, &stop),
        _ => bail!("choose exactly one of -i <ts file> (publish) or -o <file> (record)"),
    }
}

/// Stream the file as paced 1316-byte datagrams.
fn publish(
    mut conn: Connection,
    input: &PathBuf,
    bitrate_kbps: u64,
    loop_input: bool,
    stop: &AtomicBool
) -> anyhow::Result<()> {
    let delay = Duration::from_nanos(
        ((TS_DATAGRAM_LEN as u64) * 8 * 1_000_000) / bitrate_kbps.max(1)
    );
    let mut sent: u64 = 0;
    let started = Instant::now();

    loop {
        let mut file = std::fs::File::open(input).context("open input file")?;
        let mut buf = [0u8; TS_DATAGRAM_LEN];
        loop {
            if stop.load(Ordering::Acquire) || conn.is_broken() {
                info!(sent, "publish stopped");
                conn.send_shutdown();
                return Ok(());
            }
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            while !conn.send_payload(&buf[..n])? {
                std::thread::sleep(Duration::from_millis(1));
            }
            sent += 1;
            // Pace against the wall clock rather than per-datagram sleeps,
            // so short sleeps do not accumulate drift.
            let due = delay * (sent as u32);
            let elapsed = started.elapsed();
            if due > elapsed {
                std::thread::sleep(due - elapsed);
            }
        }
        if !loop_input {
            break;
        }
    }
    info!(sent, "publish complete");
    conn.send_shutdown();
    Ok(())
}

/// Write received datagrams to the output file until the stream ends.
fn record(mut conn: Connection, output: &PathBuf, stop: &AtomicBool) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(output).context("create output file")?;
    let mut received: u64 = 0;
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match conn.recv_payload() {
            Ok(Some(payload)) => {
                file.write_all(&payload)?;
                received += 1;
            }
            Ok(None) => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => {
                break;
            }
        }
    }
    file.flush()?;
    info!(received, output = %output.display(), "recording finished");
    conn.send_shutdown();
    Ok(())
}
