use crate::integration::infrastructure::{process_exists, StubHarness};
use anyhow::Result;
use difftest::{HarnessError, RestClient, ServiceConfig, SupervisorState};
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// Bootstrap, reconfigure, production, teardown against the stand-in service
#[tokio::test]
async fn test_full_lifecycle() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    let mut supervisor = harness.supervisor();
    assert_eq!(supervisor.state(), SupervisorState::NotStarted);

    supervisor.start().await?;
    assert_eq!(supervisor.state(), SupervisorState::ProductionReady);

    let pid = supervisor.process_mut().map(|p| p.pid()).expect("production process");
    assert!(process_exists(pid), "service should be running once ready");

    // Bootstrap wrote the config, reconfigure patched it
    let config = ServiceConfig::load(supervisor.config().config_path())?;
    assert_eq!(config.get("RestApiEnabled"), Some(&json!(true)));
    assert_eq!(config.rest_port()?, harness.rest_port());
    assert!(config.get("ApplicationRestTokens").and_then(|t| t.get("TESTTOKEN")).is_some());

    let client = supervisor.client().expect("client after reconfigure");
    client.token_test().await?;

    supervisor.shutdown().await?;
    assert_eq!(supervisor.state(), SupervisorState::Terminated);
    assert!(!process_exists(pid), "service should be gone after shutdown");

    // Second teardown is a no-op
    supervisor.shutdown().await?;
    info!("lifecycle completed");
    Ok(())
}

/// A config from an earlier run is reused without a bootstrap launch
#[tokio::test]
async fn test_existing_config_is_reused() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    harness.write_config(&json!({
        "RestApiEnabled": false,
        "RestApiPort": 7878,
        "EnableTokenEndpointAuthentication": false,
        "ApplicationRestTokens": {},
        "ServerName": "kept",
    }))?;

    let mut supervisor = harness.supervisor();
    supervisor.bootstrap().await?;
    assert_eq!(supervisor.state(), SupervisorState::BootstrapReady);
    assert!(supervisor.process_mut().is_none(), "no bootstrap process should run");

    supervisor.reconfigure()?;
    supervisor.launch_production().await?;

    // Fields the harness does not own survive the rewrite
    let config = ServiceConfig::load(supervisor.config().config_path())?;
    assert_eq!(config.get("ServerName"), Some(&json!("kept")));

    supervisor.shutdown().await?;
    Ok(())
}

/// A config without the REST switch fails reconfiguration
#[tokio::test]
async fn test_config_without_rest_switch_is_rejected() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    harness.write_config(&json!({ "RestApiPort": 7878 }))?;

    let mut supervisor = harness.supervisor();
    let err = supervisor.start().await.expect_err("reconfigure should fail");
    assert!(matches!(err, HarnessError::Precondition(_)), "unexpected error: {err}");
    assert_eq!(supervisor.state(), SupervisorState::Terminated);
    Ok(())
}

/// A service that never writes its config times out the bootstrap run
#[tokio::test]
async fn test_bootstrap_timeout_tears_down() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    let script = harness.write_script("silent.sh", "echo booting\nexec sleep 30")?;

    let mut config = harness.supervisor_config();
    config.executable = script;
    config.bootstrap_timeout = Duration::from_secs(1);
    let mut supervisor = difftest::ProcessSupervisor::new(config);

    let started = std::time::Instant::now();
    let err = supervisor.start().await.expect_err("bootstrap should time out");
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(10), "teardown should not wait on the child");
    assert_eq!(supervisor.state(), SupervisorState::Terminated);
    assert!(!supervisor.config().config_path().exists());
    Ok(())
}

/// A production run that exits without reporting ready times out
#[tokio::test]
async fn test_exit_before_ready_times_out() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    harness.write_config(&json!({ "RestApiEnabled": false, "RestApiPort": 7878 }))?;
    let script = harness.write_script("crash.sh", "echo loading world\nexit 3")?;

    let mut config = harness.supervisor_config();
    config.executable = script;
    config.ready_timeout = Duration::from_secs(1);
    let mut supervisor = difftest::ProcessSupervisor::new(config);

    let err = supervisor.start().await.expect_err("production should never be ready");
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert_eq!(supervisor.state(), SupervisorState::Terminated);
    Ok(())
}

/// The service refuses tokens it was not configured with
#[tokio::test]
async fn test_unknown_token_is_refused() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = StubHarness::new()?;
    let mut supervisor = harness.supervisor();
    supervisor.start().await?;

    let config = supervisor.config();
    let intruder = RestClient::local(config.bind_address, harness.rest_port(), "NOTATOKEN", Duration::from_secs(5))?;
    let result = intruder.token_test().await;

    supervisor.shutdown().await?;

    match result {
        Err(HarnessError::ExternalCall { status, .. }) => assert_eq!(status.as_u16(), 403),
        other => panic!("expected a refused call, got {other:?}"),
    }
    Ok(())
}
