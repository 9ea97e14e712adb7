use crate::api::RestClient;
use crate::environment::ThrottleSetting;
use crate::error::{HarnessError, Result};
use crate::output::OutputTailer;
use crate::poller::{Poller, ReadinessCondition, WaitOptions, DEFAULT_POLL_INTERVAL};
use crate::process::{LaunchSpec, ManagedProcess};
use crate::service_config::{RestToken, ServiceConfig, CONFIG_RELATIVE_PATH};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for bringing the service up and down.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Service executable
    pub executable: PathBuf,
    /// Directory the service runs in and writes its config under
    pub working_directory: PathBuf,
    /// Config file location, relative to the working directory
    pub config_relative_path: PathBuf,
    /// Data file handed to the production run
    pub data_file: PathBuf,
    pub bind_address: IpAddr,
    pub port: u16,
    /// Replaces the REST port found in the generated config
    pub rest_port: Option<u16>,
    pub token: RestToken,
    /// Applied to both launches through the child's environment
    pub throttle: ThrottleSetting,
    /// Copied into `plugin_dir` before the production launch
    pub plugin: Option<PathBuf>,
    pub plugin_dir: PathBuf,
    pub extra_args: Vec<String>,
    pub ready_marker: String,
    pub poll_interval: Duration,
    pub bootstrap_timeout: Duration,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(executable: impl Into<PathBuf>, working_directory: impl Into<PathBuf>, data_file: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            working_directory: working_directory.into(),
            config_relative_path: PathBuf::from(CONFIG_RELATIVE_PATH),
            data_file: data_file.into(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 17778,
            rest_port: None,
            token: RestToken::default(),
            throttle: ThrottleSetting::default(),
            plugin: None,
            plugin_dir: PathBuf::from("ServerPlugins"),
            extra_args: vec!["--stats-optout".to_string()],
            ready_marker: "Server started".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            bootstrap_timeout: Duration::from_secs(120),
            ready_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(15),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.working_directory.join(&self.config_relative_path)
    }

    fn bootstrap_launch(&self) -> LaunchSpec {
        LaunchSpec::new(&self.executable)
            .current_dir(&self.working_directory)
            .environment(self.throttle.to_environment())
    }

    fn production_launch(&self) -> LaunchSpec {
        LaunchSpec::new(&self.executable)
            .current_dir(&self.working_directory)
            .args(["-ip".to_string(), self.bind_address.to_string()])
            .args(["-port".to_string(), self.port.to_string()])
            .args(self.extra_args.iter().cloned())
            .args(["-world".to_string(), absolute(&self.data_file).display().to_string()])
            .environment(self.throttle.to_environment())
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Lifecycle of the supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    BootstrapLaunched,
    BootstrapReady,
    Reconfiguring,
    ProductionLaunched,
    ProductionReady,
    Terminated,
}

/// A process together with the tailer draining its output.
struct Running {
    process: ManagedProcess,
    tailer: OutputTailer,
}

impl Running {
    fn launch(spec: &LaunchSpec) -> Result<Self> {
        let mut process = ManagedProcess::spawn(spec)?;
        let output = process
            .take_output()
            .ok_or_else(|| HarnessError::State("process output already taken".to_string()))?;
        let tailer = OutputTailer::start(process.name().to_string(), output, Some(process.pid()));
        Ok(Self { process, tailer })
    }

    async fn shut_down(&mut self, limit: Duration) -> Result<()> {
        let killed = self.process.terminate(limit).await;
        self.tailer.stop();
        let joined = self.tailer.join(limit).await;
        killed?;
        joined?;
        Ok(())
    }
}

/// Brings the service from "not running" to "ready to serve backups", and
/// back down again.
///
/// The first run only materializes the config file. The harness then patches
/// the config and starts the service a second time with its final arguments.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    state: SupervisorState,
    running: Option<Running>,
    client: Option<RestClient>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: SupervisorState::NotStarted,
            running: None,
            client: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn client(&self) -> Option<&RestClient> {
        self.client.as_ref()
    }

    /// Poller over the output of whichever process is currently running.
    pub fn poller(&self) -> Option<Poller> {
        self.running
            .as_ref()
            .map(|running| Poller::new(running.tailer.buffer(), self.config.poll_interval))
    }

    pub fn process_mut(&mut self) -> Option<&mut ManagedProcess> {
        self.running.as_mut().map(|running| &mut running.process)
    }

    /// Runs every phase up to `ProductionReady`.
    ///
    /// On failure the service is torn down before the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        let started = self.run_phases().await;
        if let Err(ref e) = started {
            warn!("service startup failed in {:?}: {}", self.state, e);
            if let Err(shutdown_err) = self.shutdown().await {
                warn!("teardown after failed startup also failed: {}", shutdown_err);
            }
        }
        started
    }

    async fn run_phases(&mut self) -> Result<()> {
        self.bootstrap().await?;
        self.reconfigure()?;
        self.launch_production().await
    }

    /// Runs the service once so it writes its default config.
    ///
    /// Skipped if the config file already exists.
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.expect_state(SupervisorState::NotStarted)?;
        let config_path = self.config.config_path();
        if config_path.exists() {
            info!("{} already exists, skipping bootstrap run", config_path.display());
            self.state = SupervisorState::BootstrapReady;
            return Ok(());
        }

        info!("bootstrapping service in {}", self.config.working_directory.display());
        let running = Running::launch(&self.config.bootstrap_launch())?;
        let poller = Poller::new(running.tailer.buffer(), self.config.poll_interval);
        self.running = Some(running);
        self.state = SupervisorState::BootstrapLaunched;

        poller
            .wait(
                &ReadinessCondition::file_exists(&config_path),
                WaitOptions::new(self.config.bootstrap_timeout).keep_output(),
            )
            .await?;

        self.stop_running().await?;
        self.state = SupervisorState::BootstrapReady;
        info!("bootstrap produced {}", config_path.display());
        Ok(())
    }

    /// Enables the REST API with the harness token and installs the plugin.
    pub fn reconfigure(&mut self) -> Result<()> {
        self.expect_state(SupervisorState::BootstrapReady)?;
        self.state = SupervisorState::Reconfiguring;

        let mut service_config = ServiceConfig::load(self.config.config_path())?;
        service_config.enable_rest_api(&self.config.token)?;
        if let Some(port) = self.config.rest_port {
            service_config.set_rest_port(port);
        }
        let rest_port = service_config.rest_port()?;
        service_config.save()?;

        if let Some(ref plugin) = self.config.plugin {
            self.install_plugin(plugin)?;
        }

        self.client = Some(RestClient::local(
            self.config.bind_address,
            rest_port,
            self.config.token.token.clone(),
            self.config.request_timeout,
        )?);
        Ok(())
    }

    fn install_plugin(&self, plugin: &Path) -> Result<()> {
        let file_name = plugin.file_name().ok_or_else(|| {
            HarnessError::Precondition(format!("{} is not a file", plugin.display()))
        })?;
        let dir = self.config.working_directory.join(&self.config.plugin_dir);
        std::fs::create_dir_all(&dir).map_err(|e| HarnessError::file(&dir, e))?;
        let dest = dir.join(file_name);
        std::fs::copy(plugin, &dest).map_err(|e| HarnessError::file(plugin, e))?;
        info!("installed plugin {}", dest.display());
        Ok(())
    }

    /// Starts the service with its final arguments and waits until it serves.
    pub async fn launch_production(&mut self) -> Result<()> {
        self.expect_state(SupervisorState::Reconfiguring)?;
        let client = self
            .client
            .clone()
            .ok_or_else(|| HarnessError::State("no REST client configured".to_string()))?;

        let running = Running::launch(&self.config.production_launch())?;
        let poller = Poller::new(running.tailer.buffer(), self.config.poll_interval);
        self.running = Some(running);
        self.state = SupervisorState::ProductionLaunched;

        poller
            .wait_for(
                &ReadinessCondition::contains(&self.config.ready_marker),
                self.config.ready_timeout,
            )
            .await?;
        poller.buffer().clear();

        if let Some(process) = self.process_mut() {
            if let Some(status) = process.try_status()? {
                return Err(HarnessError::Precondition(format!(
                    "service exited with {status} right after reporting ready"
                )));
            }
        }

        client.token_test().await?;
        self.state = SupervisorState::ProductionReady;
        info!("service ready at {}", client.base_url());
        Ok(())
    }

    /// Kills whatever is running and waits for it. Safe to call repeatedly.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state == SupervisorState::Terminated {
            debug!("supervisor already terminated");
            return Ok(());
        }
        let stopped = self.stop_running().await;
        self.state = SupervisorState::Terminated;
        stopped
    }

    async fn stop_running(&mut self) -> Result<()> {
        match self.running.take() {
            Some(mut running) => running.shut_down(self.config.shutdown_timeout).await,
            None => Ok(()),
        }
    }

    fn expect_state(&self, expected: SupervisorState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HarnessError::State(format!(
                "expected {:?}, supervisor is {:?}",
                expected, self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_production_arguments() {
        let config = SupervisorConfig::new("/srv/TerrariaServer.exe", "/srv", "/srv/world_1.wld");
        let spec = config.production_launch();
        assert_eq!(
            spec.args,
            vec![
                "-ip",
                "127.0.0.1",
                "-port",
                "17778",
                "--stats-optout",
                "-world",
                "/srv/world_1.wld"
            ]
        );
        assert_eq!(spec.working_directory, Some(PathBuf::from("/srv")));
    }

    #[test]
    fn test_throttle_reaches_launch_environment() {
        let mut config = SupervisorConfig::new("server", "/srv", "world.wld");
        config.throttle = ThrottleSetting::Disabled;
        assert!(!config.bootstrap_launch().environment.is_empty());
        assert!(!config.production_launch().environment.is_empty());
    }

    #[tokio::test]
    async fn test_existing_config_skips_bootstrap() {
        let dir = tempdir().unwrap();
        let config = SupervisorConfig::new("/nonexistent/server", dir.path(), dir.path().join("w.wld"));
        std::fs::create_dir_all(config.config_path().parent().unwrap()).unwrap();
        std::fs::write(config.config_path(), json!({"RestApiEnabled": false, "RestApiPort": 7878}).to_string()).unwrap();

        let mut supervisor = ProcessSupervisor::new(config);
        supervisor.bootstrap().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::BootstrapReady);

        supervisor.reconfigure().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Reconfiguring);
        assert!(supervisor.client().is_some());
    }

    #[tokio::test]
    async fn test_phases_out_of_order_are_rejected() {
        let mut supervisor = ProcessSupervisor::new(SupervisorConfig::new("server", "/srv", "w.wld"));
        assert!(matches!(supervisor.reconfigure(), Err(HarnessError::State(_))));
        assert!(matches!(
            supervisor.launch_production().await,
            Err(HarnessError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut supervisor = ProcessSupervisor::new(SupervisorConfig::new("server", "/srv", "w.wld"));
        supervisor.shutdown().await.unwrap();
        supervisor.shutdown().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
    }
}
