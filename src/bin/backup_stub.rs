//! Stand-in for the game server and its differential backup plugin.
//!
//! Speaks the same contract the harness expects from the real service:
//! a bootstrap run writes `tshock/config.json` and idles, a production run
//! (`-ip`, `-port`, `-world`) serves the token-authenticated REST API and
//! prints the same console markers. The game port is accepted but not bound.

type Result<T> = color_eyre::eyre::Result<T>;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::Local;
use eyre::{eyre, WrapErr};
use qbsdiff::Bsdiff;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use walkdir::WalkDir;

use difftest::environment::THROTTLE_OVERRIDE_VAR;
use difftest::service_config::CONFIG_RELATIVE_PATH;

const DEFAULT_THROTTLE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Args {
    ip: IpAddr,
    world: Option<PathBuf>,
}

/// Single-dash flags in the game server's style; unknown flags are ignored.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args {
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        world: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-ip" => {
                let value = args.next().ok_or_else(|| eyre!("-ip needs a value"))?;
                parsed.ip = value.parse().wrap_err_with(|| format!("bad -ip {value}"))?;
            }
            "-world" => {
                parsed.world = Some(args.next().ok_or_else(|| eyre!("-world needs a value"))?.into());
            }
            "-port" => {
                args.next().ok_or_else(|| eyre!("-port needs a value"))?;
            }
            other => debug!("ignoring argument {}", other),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config_path = PathBuf::from(CONFIG_RELATIVE_PATH);

    if !config_path.exists() {
        write_default_config(&config_path).await?;
        return idle().await;
    }

    let Some(world) = args.world else {
        println!("No world selected, waiting for console input");
        return idle().await;
    };

    let config: Value = serde_json::from_str(&tokio::fs::read_to_string(&config_path).await?)?;
    if config["RestApiEnabled"] != json!(true) {
        println!("REST API disabled");
        return idle().await;
    }
    let port = config["RestApiPort"]
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| eyre!("RestApiPort missing from config"))?;
    let tokens = config["ApplicationRestTokens"]
        .as_object()
        .map(|tokens| tokens.keys().cloned().collect())
        .unwrap_or_default();

    let state = Arc::new(StubState {
        world,
        tokens,
        throttle: throttle_from_env(),
        last_backup: Mutex::new(None),
        saves: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/tokentest", get(token_test))
        .route("/v2/world/save", get(world_save))
        .with_state(state);

    let listener = TcpListener::bind((args.ip, port)).await?;
    println!("Listening for REST requests on {}", listener.local_addr()?);
    println!("Server started");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn idle() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

async fn write_default_config(path: &Path) -> Result<()> {
    println!("Creating default configuration");
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let config = json!({
        "ServerName": "",
        "RestApiEnabled": false,
        "RestApiPort": 7878,
        "EnableTokenEndpointAuthentication": false,
        "ApplicationRestTokens": {},
    });
    tokio::fs::write(path, serde_json::to_string_pretty(&config)?).await?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

/// `None` disables throttling.
fn throttle_from_env() -> Option<Duration> {
    let Ok(raw) = std::env::var(THROTTLE_OVERRIDE_VAR) else {
        return Some(DEFAULT_THROTTLE);
    };
    match raw.parse::<f64>() {
        Ok(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Ok(_) => None,
        Err(e) => {
            warn!("ignoring {}={}: {}", THROTTLE_OVERRIDE_VAR, raw, e);
            Some(DEFAULT_THROTTLE)
        }
    }
}

struct StubState {
    world: PathBuf,
    tokens: HashSet<String>,
    throttle: Option<Duration>,
    /// Also serializes backups, like the plugin's save semaphore
    last_backup: Mutex<Option<Instant>>,
    saves: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

type Reply = (StatusCode, Json<Value>);

fn reply(status: StatusCode, response: &str) -> Reply {
    (
        status,
        Json(json!({ "status": status.as_u16().to_string(), "response": response })),
    )
}

impl StubState {
    fn authorize(&self, query: &TokenQuery) -> std::result::Result<(), Reply> {
        match query.token.as_deref() {
            Some(token) if self.tokens.contains(token) => Ok(()),
            Some(_) => Err(reply(StatusCode::FORBIDDEN, "Invalid token")),
            None => Err(reply(StatusCode::UNAUTHORIZED, "Missing token")),
        }
    }
}

async fn token_test(State(state): State<Arc<StubState>>, Query(query): Query<TokenQuery>) -> Reply {
    if let Err(denied) = state.authorize(&query) {
        return denied;
    }
    reply(StatusCode::OK, "Token is valid")
}

async fn world_save(State(state): State<Arc<StubState>>, Query(query): Query<TokenQuery>) -> Reply {
    if let Err(denied) = state.authorize(&query) {
        return denied;
    }
    match save_world(&state).await {
        Ok(()) => reply(StatusCode::OK, "World saved"),
        Err(e) => {
            error!("save failed: {:#}", e);
            reply(StatusCode::INTERNAL_SERVER_ERROR, "Save failed")
        }
    }
}

async fn save_world(state: &Arc<StubState>) -> Result<()> {
    let save = state.saves.fetch_add(1, Ordering::SeqCst) + 1;
    let mut content = tokio::fs::read(&state.world).await.wrap_err("reading world")?;
    for (byte, stamp) in content.iter_mut().zip(save.to_le_bytes()) {
        *byte = stamp;
    }
    content.extend_from_slice(format!("save {save}\n").as_bytes());
    tokio::fs::write(&state.world, &content).await.wrap_err("writing world")?;
    println!("World saved");

    // The plugin reacts to the save hook in the background
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = backup(&state) {
            error!("backup failed: {:#}", e);
        }
    });
    Ok(())
}

fn backup(state: &StubState) -> Result<()> {
    let mut last = state.last_backup.lock().unwrap_or_else(PoisonError::into_inner);
    if let (Some(window), Some(previous)) = (state.throttle, *last) {
        if previous.elapsed() < window {
            println!("Backup Throttle");
            return Ok(());
        }
    }
    *last = Some(Instant::now());

    let now = Local::now();
    let mut repo = OsString::from(state.world.as_os_str());
    repo.push(".backups");
    let repo = PathBuf::from(repo);
    let folder = repo.join(now.format("%Y_%m_%d").to_string());
    std::fs::create_dir_all(&folder)?;

    let content = std::fs::read(&state.world)?;
    let extension = state
        .world
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wld".to_string());
    let time = now.format("%H_%M_%S");

    match latest_snapshot(&repo, &extension) {
        None => {
            let name = format!("{time}_{}.{extension}", short_hash(&content));
            std::fs::write(folder.join(name), &content)?;
            println!("Saved world checkpoint");
        }
        Some((reference, reference_hash)) => {
            let previous = std::fs::read(&reference)?;
            let mut patch = Vec::new();
            Bsdiff::new(&previous, &content).compare(&mut patch)?;
            std::fs::write(folder.join(format!("{time}_{reference_hash}.diff")), patch)?;
            println!("Saved new world diff");
        }
    }
    Ok(())
}

/// Newest full copy in the repository and the hash its name carries.
fn latest_snapshot(repo: &Path, extension: &str) -> Option<(PathBuf, String)> {
    let mut snapshots: Vec<PathBuf> = WalkDir::new(repo)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect();
    snapshots.sort();

    let latest = snapshots.pop()?;
    let hash = latest
        .file_stem()?
        .to_string_lossy()
        .rsplit_once('_')
        .map(|(_, hash)| hash.to_string())?;
    Some((latest, hash))
}

fn short_hash(content: &[u8]) -> String {
    hex::encode(&Sha256::digest(content)[..10])
}
