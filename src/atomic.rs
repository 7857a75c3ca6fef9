// atomic.rs - write-temp-then-rename helper for small JSON state files
// (`state/sync.json`, `state/subscriptions.json`). Same
// idiom as `store::FileStore::persist`, factored out since the Sync
// Coordinator needs it for files outside the task record layout.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    let final_path = path.to_path_buf();
    let tmp_path = final_path.with_extension("tmp");

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::write(&tmp_path, &payload)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Io(e.to_string()))??;

    Ok(())
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    #[tokio::test]
    async fn round_trips_and_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("state").join("sync.json");

        let missing: Option<BTreeMap<String, String>> = read_json(&path).await.unwrap();
        assert!(missing.is_none());

        let mut map = BTreeMap::new();
        map.insert("inbox".to_string(), "tok-1".to_string());
        write_json(&path, &map).await.unwrap();

        let loaded: BTreeMap<String, String> = read_json(&path).await.unwrap().unwrap();
        assert_eq!(loaded, map);
    }
}
