// store/quarantine.rs - moving corrupt on-disk records aside at startup
//
// Corrupt records never abort startup; they are moved into
// `quarantine/` under the store's base directory and logged.

use crate::error::Result;
use std::path::{Path, PathBuf};

pub async fn quarantine_file(base_dir: &Path, bad_file: &Path, reason: &str) -> Result<PathBuf> {
    let quarantine_dir = base_dir.join("quarantine");
    tokio::fs::create_dir_all(&quarantine_dir).await?;

    let file_name = bad_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    let dest = quarantine_dir.join(format!("{}-{}", uuid::Uuid::new_v4(), file_name));

    tokio::fs::rename(bad_file, &dest).await?;
    tracing::warn!(path = %bad_file.display(), dest = %dest.display(), %reason, "quarantined corrupt record");
    Ok(dest)
}
