use anyhow::{Context, Result};
use difftest::{ProcessSupervisor, SupervisorConfig, ThrottleSetting, VerifierConfig};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Throttle window the stand-in service runs with in these tests
pub const TEST_THROTTLE: Duration = Duration::from_secs(2);

/// Temporary server directory wired to the `backup-stub` stand-in service
pub struct StubHarness {
    temp_dir: TempDir,
    data_file: PathBuf,
    rest_port: u16,
}

impl StubHarness {
    /// Create a server directory holding a fresh data file
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let data_file = temp_dir.path().join("world_test.wld");
        std::fs::write(&data_file, initial_world()).context("Failed to write data file")?;
        let rest_port = free_port()?;

        Ok(Self {
            temp_dir,
            data_file,
            rest_port,
        })
    }

    pub fn server_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    pub fn rest_port(&self) -> u16 {
        self.rest_port
    }

    /// Supervisor settings with short deadlines for the stand-in service
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(stub_binary(), self.server_dir(), &self.data_file);
        config.rest_port = Some(self.rest_port);
        config.throttle = ThrottleSetting::Window(TEST_THROTTLE);
        config.poll_interval = Duration::from_millis(50);
        config.bootstrap_timeout = Duration::from_secs(10);
        config.ready_timeout = Duration::from_secs(10);
        config.request_timeout = Duration::from_secs(5);
        config.shutdown_timeout = Duration::from_secs(5);
        config
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            saved_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            diff_settle_delay: Duration::from_millis(750),
            throttle_window: TEST_THROTTLE,
            ..VerifierConfig::default()
        }
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(self.supervisor_config())
    }

    /// Write a config file up front, as if a bootstrap run had happened
    pub fn write_config(&self, document: &serde_json::Value) -> Result<PathBuf> {
        let path = self.supervisor_config().config_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(document)?)?;
        Ok(path)
    }

    /// Drop an executable shell script into the server directory
    pub fn write_script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let path = self.server_dir().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }
}

/// Path of the stand-in service built alongside these tests
pub fn stub_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_backup-stub"))
}

/// A port nothing is listening on right now
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("Failed to bind probe socket")?;
    Ok(listener.local_addr()?.port())
}

/// Whether a process with this pid still exists
pub fn process_exists(pid: nix::unistd::Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}

fn initial_world() -> Vec<u8> {
    (0..64 * 1024u32).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect()
}
