//! Daemon configuration: an optional TOML file overlaid by CLI flags.
//!
//! ```toml
//! api_port = 8000
//! data_dir = "/var/lib/fleetgrid"
//! sweep_interval_secs = 60
//!
//! [ports]
//! start = 20000
//! end = 30000
//!
//! [workers]
//! collection = 2
//! instance = 2
//!
//! [defaults]
//! image = "docker.io/dgkanatsios/docker_openarena_k8s:0.0.1"
//! start_map = "dm4ish"
//!
//! [queue]
//! base_delay_ms = 5
//! max_delay_secs = 1000
//! qps = 10.0
//! burst = 100
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, ValueEnum};
use fleetgrid_api::CollectionDefaults;
use fleetgrid_controller::RateLimiterConfig;
use fleetgrid_state::PortRange;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub ports: PortsConfig,
    pub workers: WorkersConfig,
    pub sweep_interval_secs: u64,
    pub defaults: DefaultsConfig,
    pub queue: QueueConfig,
}

/// Inclusive host port range handed to new instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub collection: usize,
    pub instance: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub image: String,
    pub start_map: String,
}

/// Work queue backoff and throttling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub qps: f64,
    pub burst: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            api_port: 8000,
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
            ports: PortsConfig::default(),
            workers: WorkersConfig::default(),
            sweep_interval_secs: 60,
            defaults: DefaultsConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 30000,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            collection: 2,
            instance: 2,
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            image: "docker.io/dgkanatsios/docker_openarena_k8s:0.0.1".to_string(),
            start_map: "dm4ish".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_secs: 1000,
            qps: 10.0,
            burst: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Flags of `fleetd run`. Every flag that is set overrides the file.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port the REST API listens on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Data directory for the backing store.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// First host port handed to instances.
    #[arg(long)]
    pub port_range_start: Option<u16>,

    /// Last host port handed to instances (inclusive).
    #[arg(long)]
    pub port_range_end: Option<u16>,

    /// Collection controller worker loops.
    #[arg(long)]
    pub collection_workers: Option<usize>,

    /// Instance controller worker loops.
    #[arg(long)]
    pub instance_workers: Option<usize>,

    /// Seconds between drain sweep passes.
    #[arg(long)]
    pub sweep_interval: Option<u64>,

    /// Image for collections submitted without one.
    #[arg(long)]
    pub default_image: Option<String>,

    /// Start map for collections submitted without one.
    #[arg(long)]
    pub default_map: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: FleetConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Load the file named by `args` (defaults otherwise), apply the CLI
    /// overrides and validate the result.
    pub fn resolve(args: &RunArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, args: &RunArgs) {
        if let Some(port) = args.port {
            self.api_port = port;
        }
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(start) = args.port_range_start {
            self.ports.start = start;
        }
        if let Some(end) = args.port_range_end {
            self.ports.end = end;
        }
        if let Some(n) = args.collection_workers {
            self.workers.collection = n;
        }
        if let Some(n) = args.instance_workers {
            self.workers.instance = n;
        }
        if let Some(secs) = args.sweep_interval {
            self.sweep_interval_secs = secs;
        }
        if let Some(image) = &args.default_image {
            self.defaults.image = image.clone();
        }
        if let Some(map) = &args.default_map {
            self.defaults.start_map = map.clone();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.port_range()?;
        if self.workers.collection == 0 || self.workers.instance == 0 {
            bail!("worker counts must be at least 1");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        if !(self.queue.qps > 0.0) || self.queue.burst == 0 {
            bail!("queue qps and burst must be positive");
        }
        if self.defaults.image.is_empty() {
            bail!("default image must not be empty");
        }
        Ok(())
    }

    pub fn port_range(&self) -> anyhow::Result<PortRange> {
        Ok(PortRange::new(self.ports.start, self.ports.end)?)
    }

    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            base_delay: Duration::from_millis(self.queue.base_delay_ms),
            max_delay: Duration::from_secs(self.queue.max_delay_secs),
            qps: self.queue.qps,
            burst: self.queue.burst,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn collection_defaults(&self) -> CollectionDefaults {
        CollectionDefaults {
            image: self.defaults.image.clone(),
            start_map: self.defaults.start_map.clone(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleetgrid.redb")
    }
}
