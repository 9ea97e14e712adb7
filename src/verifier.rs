use crate::api::RestClient;
use crate::backup::{BackupArtifactSet, ContentDigest};
use crate::error::{HarnessError, Result};
use crate::poller::{Poller, ReadinessCondition};
use crate::supervisor::ProcessSupervisor;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Fails the current scenario with [`HarnessError::Assertion`] unless `$cond` holds.
macro_rules! verify {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(HarnessError::Assertion(format!($($arg)+)));
        }
    };
}

/// Timing for backup scenarios.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Marker the service prints once the data file is saved
    pub saved_marker: String,
    pub saved_timeout: Duration,
    /// Wait after a trigger before looking at the backup directory
    pub settle_delay: Duration,
    /// Longer settle used around the diff scenario, where the plugin diffs the whole file
    pub diff_settle_delay: Duration,
    /// The plugin's throttle window; the diff scenario waits this long between triggers
    pub throttle_window: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            saved_marker: "World saved".to_string(),
            saved_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(10),
            diff_settle_delay: Duration::from_secs(30),
            throttle_window: Duration::from_secs(60),
        }
    }
}

/// Result of one backup trigger.
#[derive(Debug, Clone)]
pub struct BackupTrigger {
    /// Decoded body of the save call
    pub response: Value,
    /// Output up to and including the saved marker
    pub output: Vec<u8>,
    /// Data file content right after the save
    pub source: Vec<u8>,
}

impl BackupTrigger {
    pub fn digest(&self) -> ContentDigest {
        ContentDigest::of(&self.source)
    }
}

/// Which scenario to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// One trigger produces one full copy of the data file
    SingleBackup,
    /// Two triggers beyond the throttle window produce a snapshot and a diff
    TwoBackups,
    /// A second trigger inside the throttle window produces nothing new
    ThrottledBackup,
}

/// Drives the service's backup feature and checks what it writes.
pub struct BackupVerifier {
    client: RestClient,
    poller: Poller,
    data_file: PathBuf,
    config: VerifierConfig,
}

impl BackupVerifier {
    pub fn new(client: RestClient, poller: Poller, data_file: impl Into<PathBuf>, config: VerifierConfig) -> Self {
        Self {
            client,
            poller,
            data_file: data_file.into(),
            config,
        }
    }

    /// Builds a verifier for a supervisor that reached `ProductionReady`.
    pub fn for_supervisor(supervisor: &ProcessSupervisor, config: VerifierConfig) -> Result<Self> {
        let client = supervisor
            .client()
            .cloned()
            .ok_or_else(|| HarnessError::State("service has no REST client yet".to_string()))?;
        let poller = supervisor
            .poller()
            .ok_or_else(|| HarnessError::State("service is not running".to_string()))?;
        Ok(Self::new(client, poller, &supervisor.config().data_file, config))
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    pub fn backup_dir(&self) -> PathBuf {
        BackupArtifactSet::directory_for(&self.data_file)
    }

    pub fn artifacts(&self) -> Result<Option<BackupArtifactSet>> {
        BackupArtifactSet::scan(&self.data_file)
    }

    pub fn artifact_count(&self) -> Result<usize> {
        Ok(self.artifacts()?.map_or(0, |set| set.len()))
    }

    /// Requests a save and waits for the service to report it.
    pub async fn trigger_backup(&self) -> Result<BackupTrigger> {
        let response = self.client.save_world().await?;
        debug!("save response: {}", response);

        let output = self
            .poller
            .wait_for(
                &ReadinessCondition::contains(&self.config.saved_marker),
                self.config.saved_timeout,
            )
            .await?;
        let source = std::fs::read(&self.data_file).map_err(|e| HarnessError::file(&self.data_file, e))?;
        info!("backup triggered, source digest {}", ContentDigest::of(&source));

        Ok(BackupTrigger {
            response,
            output,
            source,
        })
    }

    pub async fn run(&self, scenario: Scenario) -> Result<()> {
        info!("running scenario {:?}", scenario);
        match scenario {
            Scenario::SingleBackup => self.single_backup().await,
            Scenario::TwoBackups => self.two_backups().await,
            Scenario::ThrottledBackup => self.throttled_backup().await,
        }
    }

    pub fn assert_no_backups(&self) -> Result<()> {
        verify!(
            !self.backup_dir().exists(),
            "{} exists before any backup was triggered",
            self.backup_dir().display()
        );
        Ok(())
    }

    /// Checks the directory still holds exactly `before` artifacts.
    pub fn assert_no_new_artifact(&self, before: usize) -> Result<()> {
        let now = self.artifact_count()?;
        verify!(now == before, "expected {} artifacts, found {}", before, now);
        Ok(())
    }

    /// One trigger leaves exactly one artifact, identical to the data file.
    pub async fn single_backup(&self) -> Result<()> {
        self.assert_no_backups()?;
        let trigger = self.trigger_backup().await?;
        sleep(self.config.settle_delay).await;

        let set = self.require_artifacts()?;
        verify!(set.len() == 1, "expected 1 artifact, found {}", set.len());

        let copy = set.iter().next().map(|artifact| artifact.read()).transpose()?.unwrap_or_default();
        verify!(
            ContentDigest::of(&copy) == trigger.digest(),
            "backup copy {} differs from the data file {}",
            ContentDigest::of(&copy),
            trigger.digest()
        );
        Ok(())
    }

    /// Two triggers a throttle window apart leave a snapshot and a diff that
    /// together rebuild the data file as of the second trigger.
    pub async fn two_backups(&self) -> Result<()> {
        self.assert_no_backups()?;
        self.trigger_backup().await?;
        sleep(self.config.diff_settle_delay).await;
        verify!(
            self.backup_dir().exists(),
            "{} missing after the first backup",
            self.backup_dir().display()
        );

        sleep(self.config.throttle_window).await;
        let second = self.trigger_backup().await?;
        sleep(self.config.diff_settle_delay).await;

        let set = self.require_artifacts()?;
        verify!(set.len() == 2, "expected 2 artifacts, found {}", set.len());

        let snapshots = set.snapshots().count();
        let diffs = set.diffs().count();
        verify!(
            snapshots == 1 && diffs == 1,
            "expected one snapshot and one diff, found {} and {}",
            snapshots,
            diffs
        );

        let rebuilt = set.reconstruct_latest()?;
        verify!(
            ContentDigest::of(&rebuilt) == second.digest(),
            "snapshot + diff rebuilds {}, data file is {}",
            ContentDigest::of(&rebuilt),
            second.digest()
        );
        Ok(())
    }

    /// A second trigger inside the throttle window adds no artifact.
    pub async fn throttled_backup(&self) -> Result<()> {
        self.assert_no_backups()?;
        self.trigger_backup().await?;
        sleep(self.config.settle_delay).await;
        let before = self.artifact_count()?;
        verify!(before > 0, "first backup produced no artifact");

        self.trigger_backup().await?;
        sleep(self.config.settle_delay).await;
        self.assert_no_new_artifact(before)
    }

    fn require_artifacts(&self) -> Result<BackupArtifactSet> {
        match self.artifacts()? {
            Some(set) => Ok(set),
            None => Err(HarnessError::Assertion(format!(
                "{} is not a directory",
                self.backup_dir().display()
            ))),
        }
    }
}
