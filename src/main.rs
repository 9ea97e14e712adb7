type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config, WorldSource};
use difftest::{fixtures, BackupVerifier, ProcessSupervisor};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    if let Some(ref url) = config.release_url {
        fixtures::fetch_release(url, &config.server_dir).await?;
    }

    let data_file = match config.world {
        WorldSource::Path(ref path) => path.clone(),
        WorldSource::Url(ref url) => fixtures::download_data_file(url, &config.server_dir).await?,
    };

    let mut supervisor = ProcessSupervisor::new(config.supervisor_config(data_file));
    let outcome = run_scenario(&config, &mut supervisor).await;

    // Teardown runs whatever the scenario did
    if let Err(e) = supervisor.shutdown().await {
        error!("shutdown failed: {}", e);
    }

    outcome?;
    info!("scenario {:?} passed", config.scenario);
    Ok(())
}

async fn run_scenario(config: &Config, supervisor: &mut ProcessSupervisor) -> Result<()> {
    supervisor.start().await?;
    let verifier = BackupVerifier::for_supervisor(supervisor, config.verifier_config())?;
    verifier.run(config.scenario).await?;
    Ok(())
}
