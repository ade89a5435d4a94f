use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::codec::{Direction, ProbeLayout};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing --dev option")]
    NoDevices,
    #[error("the directional probe needs at least one --direction")]
    NoDirections,
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network devices to attach the probe to.
    #[serde(default)]
    pub devices: Vec<String>,

    /// Address the metrics endpoint listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// dnsmasq lease file. Empty disables hostname enrichment.
    #[serde(default = "default_leases")]
    pub leases: PathBuf,

    /// Console stats interval in seconds. 0 = disabled.
    #[serde(default)]
    pub stats_interval_seconds: u64,

    /// Compiled probe object.
    #[serde(default = "default_probe")]
    pub probe: PathBuf,

    /// Record layout of the probe object.
    #[serde(default = "default_layout")]
    pub layout: ProbeLayout,

    /// Directions to attach for the directional probe.
    #[serde(default = "default_directions")]
    pub directions: Vec<Direction>,

    /// bpffs directory for pinned links.
    #[serde(default = "default_pin_dir")]
    pub pin_dir: PathBuf,

    /// Pages per CPU for the event perf buffers.
    #[serde(default)]
    pub perf_pages: Option<usize>,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9042))
}

fn default_leases() -> PathBuf {
    PathBuf::from("/run/dnsmasq.leases")
}

fn default_probe() -> PathBuf {
    PathBuf::from("overseer-ebpf/target/bpfel-unknown-none/release/overseer")
}

fn default_layout() -> ProbeLayout {
    ProbeLayout::Directional
}

fn default_directions() -> Vec<Direction> {
    vec![Direction::Ingress, Direction::Egress]
}

fn default_pin_dir() -> PathBuf {
    PathBuf::from("/sys/fs/bpf/overseer")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            listen: default_listen(),
            leases: default_leases(),
            stats_interval_seconds: 0,
            probe: default_probe(),
            layout: default_layout(),
            directions: default_directions(),
            pin_dir: default_pin_dir(),
            perf_pages: None,
            quiet: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        let devices: Vec<String> = cli
            .dev
            .iter()
            .flat_map(|d| d.split(','))
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(String::from)
            .collect();
        if !devices.is_empty() {
            self.devices = devices;
        }
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if let Some(leases) = &cli.leases {
            self.leases = leases.clone();
        }
        if let Some(interval) = cli.stats_interval {
            self.stats_interval_seconds = interval;
        }
        if let Some(probe) = &cli.probe {
            self.probe = probe.clone();
        }
        if let Some(layout) = cli.layout {
            self.layout = layout;
        }
        if !cli.direction.is_empty() {
            self.directions = cli.direction.clone();
        }
        if let Some(pin_dir) = &cli.pin_dir {
            self.pin_dir = pin_dir.clone();
        }
        if cli.perf_pages.is_some() {
            self.perf_pages = cli.perf_pages;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        if self.layout.has_direction() && self.directions.is_empty() {
            return Err(ConfigError::NoDirections);
        }
        Ok(())
    }
}

use clap::Parser;

/// overseer: per-host flow telemetry from an XDP/TC probe
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Comma separated list of devices to attach to. May be repeated.
    #[arg(short, long)]
    pub dev: Vec<String>,

    /// Metrics server host:port.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// dnsmasq lease file ("" disables).
    #[arg(long)]
    pub leases: Option<PathBuf>,

    /// Console stats interval in seconds (0 = disabled).
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Path to the compiled probe object.
    #[arg(long)]
    pub probe: Option<PathBuf>,

    /// Record layout of the probe object.
    #[arg(long, value_enum)]
    pub layout: Option<ProbeLayout>,

    /// Traffic direction to attach (directional probe only). Repeat for both.
    #[arg(long, value_enum)]
    pub direction: Vec<Direction>,

    /// bpffs directory for pinned links.
    #[arg(long)]
    pub pin_dir: Option<PathBuf>,

    /// Pages per CPU for the event perf buffers (power of two).
    #[arg(long)]
    pub perf_pages: Option<usize>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
