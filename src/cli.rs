use clap::{Parser, ValueEnum};
use eyre::eyre;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use difftest::{Scenario, SupervisorConfig, ThrottleSetting, VerifierConfig};

type Result<T> = color_eyre::eyre::Result<T>;

/// Checks a service's differential backups end to end
#[derive(Parser)]
#[command(name = "difftest")]
#[command(about = "Checks a service's differential backups end to end")]
#[command(version)]
pub struct Cli {
    /// Directory holding the service installation
    #[arg(long)]
    pub server_dir: PathBuf,

    /// Service executable, relative to the server directory
    #[arg(long, default_value = "TerrariaServer.exe")]
    pub executable: PathBuf,

    /// Existing data file to back up
    #[arg(long, conflicts_with = "world_url")]
    pub world: Option<PathBuf>,

    /// Download the data file from this URL into the server directory
    #[arg(long)]
    pub world_url: Option<String>,

    /// Fetch and unpack a release archive into the server directory first
    #[arg(long)]
    pub release_url: Option<String>,

    /// Plugin to install before the production run
    #[arg(long)]
    pub plugin: Option<PathBuf>,

    /// Scenario to run
    #[arg(long, value_enum, default_value = "single")]
    pub scenario: ScenarioArg,

    /// Address the service binds to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind_addr: String,

    /// Port the service listens on
    #[arg(long, default_value = "17778")]
    pub port: u16,

    /// Override the REST port from the generated config
    #[arg(long)]
    pub rest_port: Option<u16>,

    /// Output polling interval (ms)
    #[arg(long, default_value = "250")]
    pub poll_interval_ms: u64,

    /// Deadline for the bootstrap run to write its config (seconds)
    #[arg(long, default_value = "120")]
    pub bootstrap_timeout_secs: u64,

    /// Deadline for the production run to report ready (seconds)
    #[arg(long, default_value = "300")]
    pub ready_timeout_secs: u64,

    /// Wait after a backup before inspecting artifacts (seconds)
    #[arg(long, default_value = "10")]
    pub settle_secs: u64,

    /// Backup throttle window the service runs with (seconds)
    #[arg(long, default_value = "60")]
    pub throttle_window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioArg {
    Single,
    Twice,
    Throttled,
}

impl From<ScenarioArg> for Scenario {
    fn from(arg: ScenarioArg) -> Self {
        match arg {
            ScenarioArg::Single => Scenario::SingleBackup,
            ScenarioArg::Twice => Scenario::TwoBackups,
            ScenarioArg::Throttled => Scenario::ThrottledBackup,
        }
    }
}

/// Where the data file comes from
#[derive(Debug, Clone)]
pub enum WorldSource {
    Path(PathBuf),
    Url(String),
}

/// Configuration for one harness run
#[derive(Debug, Clone)]
pub struct Config {
    pub server_dir: PathBuf,
    pub executable: PathBuf,
    pub world: WorldSource,
    pub release_url: Option<String>,
    pub plugin: Option<PathBuf>,
    pub scenario: Scenario,
    pub bind_address: IpAddr,
    pub port: u16,
    pub rest_port: Option<u16>,
    pub poll_interval: Duration,
    pub bootstrap_timeout: Duration,
    pub ready_timeout: Duration,
    pub settle_delay: Duration,
    pub throttle_window: Duration,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let bind_address: IpAddr = cli
            .bind_addr
            .parse()
            .map_err(|e| eyre!("Invalid bind address '{}': {}", cli.bind_addr, e))?;

        let world = match (cli.world, cli.world_url) {
            (Some(path), None) => WorldSource::Path(path),
            (None, Some(url)) => WorldSource::Url(url),
            _ => return Err(eyre!("exactly one of --world or --world-url is required")),
        };

        if cli.poll_interval_ms == 0 {
            return Err(eyre!("--poll-interval-ms must be greater than zero"));
        }

        Ok(Config {
            executable: cli.server_dir.join(cli.executable),
            server_dir: cli.server_dir,
            world,
            release_url: cli.release_url,
            plugin: cli.plugin,
            scenario: cli.scenario.into(),
            bind_address,
            port: cli.port,
            rest_port: cli.rest_port,
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            bootstrap_timeout: Duration::from_secs(cli.bootstrap_timeout_secs),
            ready_timeout: Duration::from_secs(cli.ready_timeout_secs),
            settle_delay: Duration::from_secs(cli.settle_secs),
            throttle_window: Duration::from_secs(cli.throttle_window_secs),
        })
    }

    /// Supervisor settings once the data file is known
    pub fn supervisor_config(&self, data_file: PathBuf) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(&self.executable, &self.server_dir, data_file);
        config.bind_address = self.bind_address;
        config.port = self.port;
        config.rest_port = self.rest_port;
        config.plugin = self.plugin.clone();
        config.poll_interval = self.poll_interval;
        config.bootstrap_timeout = self.bootstrap_timeout;
        config.ready_timeout = self.ready_timeout;
        config.throttle = ThrottleSetting::Window(self.throttle_window);
        config
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            settle_delay: self.settle_delay,
            throttle_window: self.throttle_window,
            ..VerifierConfig::default()
        }
    }
}
