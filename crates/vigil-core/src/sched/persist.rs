//! State file I/O

use std::path::Path;

use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::debug;

use crate::error::Result;

/// Read and decode `path`; `None` if it does not exist yet
pub(crate) async fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Replace `path` with `bytes` through a sibling temp file, so a crash
/// mid-write never leaves a truncated state file behind.
pub(crate) async fn save(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = bytes.len(), "Saved schedule state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<BTreeMap<String, u32>> = load(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let data: BTreeMap<String, u32> = [("a".to_string(), 1)].into_iter().collect();

        save(&path, &serde_json::to_vec(&data).unwrap()).await.unwrap();
        let loaded: Option<BTreeMap<String, u32>> = load(&path).await.unwrap();

        assert_eq!(loaded, Some(data));
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let loaded: Result<Option<BTreeMap<String, u32>>> = load(&path).await;
        assert!(loaded.is_err());
    }
}
