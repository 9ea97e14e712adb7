use crate::integration::infrastructure::StubHarness;
use anyhow::{Context, Result};
use difftest::{ArtifactKind, BackupVerifier, ContentDigest, ProcessSupervisor, Scenario};
use tracing::info;

async fn ready_verifier(harness: &StubHarness) -> Result<(ProcessSupervisor, BackupVerifier)> {
    let mut supervisor = harness.supervisor();
    supervisor.start().await?;
    let verifier = BackupVerifier::for_supervisor(&supervisor, harness.verifier_config())?;
    Ok((supervisor, verifier))
}

/// Run `scenario`, tearing the service down whatever the outcome
async fn run_scenario(harness: &StubHarness, scenario: Scenario) -> Result<BackupVerifier> {
    let (mut supervisor, verifier) = ready_verifier(harness).await?;
    let outcome = verifier.run(scenario).await;
    supervisor.shutdown().await?;
    outcome.with_context(|| format!("scenario {scenario:?} failed"))?;
    Ok(verifier)
}

#[tokio::test]
async fn test_single_backup_copies_data_file() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    let verifier = run_scenario(&harness, Scenario::SingleBackup).await?;

    let set = verifier.artifacts()?.context("backup directory")?;
    assert_eq!(set.len(), 1);
    let artifact = set.iter().next().context("one artifact")?;
    assert_eq!(artifact.kind, ArtifactKind::Snapshot);
    assert_eq!(
        ContentDigest::of(&artifact.read()?),
        ContentDigest::of(&std::fs::read(harness.data_file())?)
    );
    Ok(())
}

#[tokio::test]
async fn test_second_backup_writes_diff() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    let verifier = run_scenario(&harness, Scenario::TwoBackups).await?;

    let set = verifier.artifacts()?.context("backup directory")?;
    assert_eq!(set.snapshots().count(), 1);
    assert_eq!(set.diffs().count(), 1);
    assert_eq!(set.reconstruct_latest()?, std::fs::read(harness.data_file())?);
    Ok(())
}

#[tokio::test]
async fn test_backup_inside_throttle_window_is_skipped() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    let verifier = run_scenario(&harness, Scenario::ThrottledBackup).await?;
    assert_eq!(verifier.artifact_count()?, 1);
    Ok(())
}

/// The trigger reports the save call's body and the output up to the marker
#[tokio::test]
async fn test_trigger_captures_response_and_output() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    let before = std::fs::read(harness.data_file())?;
    let (mut supervisor, verifier) = ready_verifier(&harness).await?;

    verifier.assert_no_backups()?;
    let trigger = verifier.trigger_backup().await;
    supervisor.shutdown().await?;
    let trigger = trigger?;

    assert_eq!(trigger.response["status"], "200");
    let output = String::from_utf8_lossy(&trigger.output);
    assert!(output.contains("World saved"), "output was {output:?}");
    assert_ne!(trigger.source, before, "save should change the data file");
    info!("source digest {}", trigger.digest());
    Ok(())
}

/// Disabling the throttle lets back-to-back saves each leave an artifact
#[tokio::test]
async fn test_disabled_throttle_backs_up_every_save() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    let mut config = harness.supervisor_config();
    config.throttle = difftest::ThrottleSetting::Disabled;
    let mut supervisor = ProcessSupervisor::new(config);
    supervisor.start().await?;
    let verifier = BackupVerifier::for_supervisor(&supervisor, harness.verifier_config())?;

    let mut outcome = Ok(());
    for _ in 0..2 {
        outcome = verifier.trigger_backup().await.map(|_| ());
        if outcome.is_err() {
            break;
        }
        tokio::time::sleep(harness.verifier_config().settle_delay).await;
    }
    supervisor.shutdown().await?;
    outcome?;

    assert_eq!(verifier.artifact_count()?, 2);
    Ok(())
}
