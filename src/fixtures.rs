//! Fetching the service and its data file before a run.

use crate::error::{HarnessError, Result};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Downloads a zip release archive and unpacks it into `dest`.
pub async fn fetch_release(url: &str, dest: &Path) -> Result<()> {
    info!("fetching release {} into {}", url, dest.display());
    let archive = download(url).await?;

    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dest).map_err(|e| HarnessError::file(&dest, e))?;
        let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
        zip.extract(&dest)?;
        info!("extracted {} entries into {}", zip.len(), dest.display());
        Ok(())
    })
    .await?
}

/// Downloads a data file into `dest` under a fresh random name.
///
/// Random names keep the backup directories of separate runs apart.
pub async fn download_data_file(url: &str, dest: &Path) -> Result<PathBuf> {
    let bytes = download(url).await?;
    let target = dest.join(format!("world_{}.wld", Uuid::new_v4().simple()));
    tokio::fs::write(&target, &bytes)
        .await
        .map_err(|e| HarnessError::file(&target, e))?;
    info!("saved data file {} ({} bytes)", target.display(), bytes.len());
    Ok(target)
}

async fn download(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(HarnessError::ExternalCall {
            endpoint: url.to_string(),
            status,
        });
    }
    Ok(response.bytes().await?.to_vec())
}
