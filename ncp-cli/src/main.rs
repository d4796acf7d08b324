//! ncpcat - reference consumer for the ncp probe
//!
//! Attaches to the probe, appends one line per event to a log file, and
//! detaches cleanly on Ctrl+C or after a receive error.

use anyhow::{Context, Result};
use clap::Parser;
use ncp_cli::{run_session, Client, EventSink, Outcome, RateMeter};
use ncp_common::ConnEvent;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;

const WRITE_BUFFER: usize = 512 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "ncpcat")]
#[command(about = "Stream connection events from the ncp probe", long_about = None)]
#[command(version)]
struct Cli {
    /// Probe socket
    #[arg(short, long, default_value = "/run/ncp.sock", env = "NCP_SOCKET")]
    socket: PathBuf,

    /// File events are appended to
    #[arg(short, long, default_value = "ncp.log")]
    output: PathBuf,

    /// Print every event instead of the rate line
    #[arg(short = 'v', long)]
    display: bool,

    /// Prefix each line with the local receive time
    #[arg(short, long)]
    timestamps: bool,

    /// Socket this consumer listens on (default: a per-process path in the temp directory)
    #[arg(long)]
    bind: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cli.output)
        .with_context(|| format!("Failed to open {}", cli.output.display()))?;

    let local = cli.bind.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("ncpcat-{}.sock", std::process::id()))
    });
    let mut client = Client::bind(&cli.socket, &local)
        .with_context(|| format!("Failed to bind {}", local.display()))?;

    println!("Capture started.");
    client
        .attach(HANDSHAKE_TIMEOUT)
        .await
        .with_context(|| format!("Failed to connect to probe at {}", cli.socket.display()))?;

    let mut sink = LineSink {
        out: BufWriter::with_capacity(WRITE_BUFFER, file),
        display: cli.display,
        timestamps: cli.timestamps,
        meter: RateMeter::default(),
    };
    let shutdown = async {
        let _ = signal::ctrl_c().await;
    };
    let outcome = run_session(&mut client, &mut sink, shutdown).await;

    if let Err(e) = sink.out.flush() {
        eprintln!("Failed to flush output: {}", e);
    }
    if outcome.context("Failed to receive from probe")? == Outcome::Closed {
        println!("\nProbe closed the session");
    }
    println!("\nServer shutdown ({} events)", sink.meter.total());
    Ok(())
}

struct LineSink<W: Write> {
    out: W,
    display: bool,
    timestamps: bool,
    meter: RateMeter,
}

impl<W: Write> EventSink for LineSink<W> {
    fn write(&mut self, events: &[ConnEvent]) -> std::io::Result<()> {
        self.meter.record(events.len());
        let stamp = self
            .timestamps
            .then(|| chrono::Local::now().format("%H:%M:%S%.3f").to_string());

        for event in events {
            let line = match &stamp {
                Some(stamp) => format!("{} {}", stamp, event),
                None => event.to_string(),
            };
            if self.display {
                println!("{}", line);
            }
            writeln!(self.out, "{}", line)?;
        }
        Ok(())
    }

    fn tick(&mut self) {
        if !self.display {
            print!("{:<60}\r", self.meter.tick());
            let _ = std::io::stdout().flush();
        }
    }
}
