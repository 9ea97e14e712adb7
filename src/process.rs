use crate::environment::Environment;
use crate::error::{HarnessError, Result};
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Everything needed to start one run of the service.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments for the executable
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_directory: Option<PathBuf>,
    /// Added on top of the inherited environment, for this launch only
    pub environment: Environment,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn environment(mut self, env: Environment) -> Self {
        self.environment.extend(env);
        self
    }
}

/// A running external process, owned by whoever spawned it.
///
/// stdout and stderr share one pipe, so the captured output interleaves the
/// way a terminal would show it. The process leads its own process group;
/// termination signals go to the whole group.
pub struct ManagedProcess {
    name: String,
    pid: Pid,
    start_time: Instant,
    child: Child,
    /// Held open so the service does not read end-of-file on its console
    stdin: Option<ChildStdin>,
    output: Option<pipe::Receiver>,
    exit_status: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Spawns the process described by `spec`.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        let name = spec
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.program.display().to_string());
        info!("Spawning process: {} {:?}", spec.program.display(), spec.args);

        let (reader, writer) = pipe2(OFlag::O_CLOEXEC)?;

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::from(writer.try_clone()?));
        command.stderr(Stdio::from(writer));

        if let Some(ref work_dir) = spec.working_directory {
            command.current_dir(work_dir);
        }
        for (key, value) in spec.environment.iter() {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| HarnessError::file(&spec.program, e))?;
        // Drop our copies of the write end, otherwise the reader never sees EOF
        drop(command);

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid as i32),
            None => {
                return Err(HarnessError::State(format!(
                    "{name} exited before its PID could be read"
                )))
            }
        };
        let output = pipe::Receiver::from_owned_fd(reader)?;

        info!("Process spawned with PID: {}", pid);
        Ok(Self {
            name,
            pid,
            start_time: Instant::now(),
            stdin: child.stdin.take(),
            child,
            output: Some(output),
            exit_status: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn runtime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Hands out the merged output stream. Only the first call returns it.
    pub fn take_output(&mut self) -> Option<pipe::Receiver> {
        self.output.take()
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn is_terminated(&self) -> bool {
        self.exit_status.is_some()
    }

    /// Reaps the process if it already exited, without blocking.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit_status.is_none() {
            if let Some(status) = self.child.try_wait()? {
                debug!("{} ({}) exited with {:?}", self.name, self.pid, status);
                self.exit_status = Some(status);
            }
        }
        Ok(self.exit_status)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_status(), Ok(None))
    }

    /// Sends SIGKILL to the process group.
    ///
    /// The group is signalled even when the leader already exited, since its
    /// children may still be running. Killing an empty group is not an error.
    pub fn kill(&mut self) -> Result<()> {
        if self.try_status()?.is_some() {
            debug!("{} ({}) already exited, killing what is left of its group", self.name, self.pid);
        } else {
            info!("Force killing process {}", self.pid);
        }

        match killpg(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Waits up to `limit` for the process to exit.
    ///
    /// Returns `Ok(None)` if it is still running at the deadline.
    pub async fn wait_timeout(&mut self, limit: Duration) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        match timeout(limit, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!("Process {} exited with status: {:?}", self.pid, status);
                self.exit_status = Some(status);
                Ok(Some(status))
            }
            Err(_) => Ok(None),
        }
    }

    /// Kills the process and waits (bounded) for it to be reaped.
    pub async fn terminate(&mut self, limit: Duration) -> Result<Option<ExitStatus>> {
        self.stdin.take();
        self.kill()?;
        let status = self.wait_timeout(limit).await?;
        if status.is_none() {
            warn!("{} ({}) still running {:?} after SIGKILL", self.name, self.pid, limit);
        }
        Ok(status)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        // kill_on_drop only reaches the leader, the group may have children
        match killpg(self.pid, Signal::SIGKILL) {
            Ok(()) if self.exit_status.is_none() => warn!(
                "{} ({}) dropped while running, killed its process group",
                self.name, self.pid
            ),
            Ok(()) => debug!("{} ({}) dropped, killed leftover group members", self.name, self.pid),
            Err(nix::Error::ESRCH) => {}
            Err(e) => warn!("failed to kill process group {}: {}", self.pid, e),
        }
    }
}
