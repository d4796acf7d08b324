//! Probe configuration
//!
//! Resolution order: defaults, then the YAML file, then command-line flags
//! (which clap backs with `NCP_*` environment variables).

use crate::filter::AddressFilter;
use crate::{NcpError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Source address filter, dotted quad. Unset or empty matches any source.
    pub from: Option<String>,

    /// Destination address filter, dotted quad. Unset or empty matches any destination.
    pub to: Option<String>,

    /// Events per message. 0 sends every event on its own.
    pub buf: u32,

    /// Path of the socket consumers talk to
    pub socket: PathBuf,

    /// Capture on this interface only
    pub interface: Option<String>,

    /// Capture threads sharing one fanout group
    pub workers: usize,

    /// Prometheus textfile rewritten every `metrics_interval_secs`
    pub metrics_file: Option<PathBuf>,

    pub metrics_interval_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            buf: defaults::BATCH_SIZE,
            socket: PathBuf::from(defaults::SOCKET_PATH),
            interface: None,
            workers: defaults::WORKERS,
            metrics_file: None,
            metrics_interval_secs: defaults::METRICS_INTERVAL_SECS,
        }
    }
}

pub mod defaults {
    pub const BATCH_SIZE: u32 = 100;
    pub const SOCKET_PATH: &str = "/run/ncp.sock";
    pub const WORKERS: usize = 1;
    pub const METRICS_INTERVAL_SECS: u64 = 10;
}

/// Values given on the command line. `None` keeps the file or default value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub from: Option<String>,
    pub to: Option<String>,
    pub buf: Option<u32>,
    pub socket: Option<PathBuf>,
    pub interface: Option<String>,
    pub workers: Option<usize>,
    pub metrics_file: Option<PathBuf>,
}

impl ProbeConfig {
    /// Reads a YAML configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            NcpError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&text)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty document is a valid, all-defaults configuration.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Defaults, overlaid with the optional file, overlaid with `overrides`, then validated.
    pub fn resolve(file: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if overrides.from.is_some() {
            self.from = overrides.from;
        }
        if overrides.to.is_some() {
            self.to = overrides.to;
        }
        if let Some(buf) = overrides.buf {
            self.buf = buf;
        }
        if let Some(socket) = overrides.socket {
            self.socket = socket;
        }
        if overrides.interface.is_some() {
            self.interface = overrides.interface;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        if overrides.metrics_file.is_some() {
            self.metrics_file = overrides.metrics_file;
        }
    }

    /// Rejects values the probe cannot run with.
    ///
    /// Filter strings are not checked here: a malformed filter only disables
    /// that filter.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(NcpError::ConfigError("workers must be at least 1".into()));
        }
        if self.metrics_interval_secs == 0 {
            return Err(NcpError::ConfigError(
                "metrics_interval_secs must be at least 1".into(),
            ));
        }
        if self.socket.as_os_str().is_empty() {
            return Err(NcpError::ConfigError("socket path is empty".into()));
        }
        if matches!(self.interface.as_deref(), Some("")) {
            return Err(NcpError::ConfigError("interface name is empty".into()));
        }
        Ok(())
    }

    /// Builds the address filter, logging and dropping malformed filters.
    pub fn filter(&self) -> AddressFilter {
        AddressFilter::from_config(self.from.as_deref(), self.to.as_deref())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
