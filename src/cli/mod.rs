pub mod commands;

use crate::config::Overrides;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ncp")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Network connection probe: streams TCP/UDP connection tuples to one consumer", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Capture packets and serve the attached consumer")]
    Run {
        #[command(flatten)]
        probe: ProbeArgs,
    },
    #[command(about = "Print the effective configuration and exit")]
    Config {
        #[command(flatten)]
        probe: ProbeArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ProbeArgs {
    #[arg(short, long, value_name = "FILE", env = "NCP_CONFIG", help = "YAML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", env = "NCP_FROM", help = "Only report packets from this IPv4 address")]
    pub from: Option<String>,

    #[arg(long, value_name = "ADDR", env = "NCP_TO", help = "Only report packets to this IPv4 address")]
    pub to: Option<String>,

    #[arg(short, long, value_name = "N", env = "NCP_BUF", help = "Events per message, 0 disables batching [default: 100]")]
    pub buf: Option<u32>,

    #[arg(short, long, value_name = "PATH", env = "NCP_SOCKET", help = "Socket consumers connect to [default: /run/ncp.sock]")]
    pub socket: Option<PathBuf>,

    #[arg(short, long, value_name = "NAME", help = "Capture on this interface only")]
    pub interface: Option<String>,

    #[arg(short, long, value_name = "N", help = "Capture threads [default: 1]")]
    pub workers: Option<usize>,

    #[arg(long, value_name = "FILE", help = "Rewrite this Prometheus textfile periodically")]
    pub metrics_file: Option<PathBuf>,
}

impl ProbeArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            from: self.from.clone(),
            to: self.to.clone(),
            buf: self.buf,
            socket: self.socket.clone(),
            interface: self.interface.clone(),
            workers: self.workers,
            metrics_file: self.metrics_file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "ncp", "-v", "run", "--from", "10.0.0.1", "--buf", "0", "--socket", "/tmp/n.sock",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Some(Commands::Run { probe }) = cli.command else {
            panic!("expected run");
        };
        let overrides = probe.overrides();
        assert_eq!(overrides.from.as_deref(), Some("10.0.0.1"));
        assert_eq!(overrides.buf, Some(0));
        assert_eq!(overrides.socket, Some(PathBuf::from("/tmp/n.sock")));
        assert_eq!(overrides.to, None);
    }

    #[test]
    fn test_rejects_negative_batch() {
        assert!(Cli::try_parse_from(["ncp", "run", "--buf", "-1"]).is_err());
    }
}
