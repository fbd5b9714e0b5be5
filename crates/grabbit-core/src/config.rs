//! Settings loading (JSON file, missing file means defaults)

use crate::error::GrabbitError;
use grabbit_types::Settings;
use std::path::Path;
use tokio::fs;

/// Load settings from a JSON file
pub async fn load_settings(path: &Path) -> Result<Settings, GrabbitError> {
    if !path.exists() {
        tracing::debug!("No settings file at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).await?;
    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| GrabbitError::Config(format!("{}: {}", path.display(), e)))?;

    validate_settings(&settings)?;
    Ok(settings)
}

/// Reject settings the engine cannot run with
pub fn validate_settings(settings: &Settings) -> Result<(), GrabbitError> {
    if settings.max_concurrent_downloads == 0 {
        return Err(GrabbitError::Config(
            "max_concurrent_downloads must be at least 1".to_string(),
        ));
    }
    if settings.block_size == 0 {
        return Err(GrabbitError::Config("block_size must be positive".to_string()));
    }
    if settings.storage_dir.as_os_str().is_empty() {
        return Err(GrabbitError::Config("storage_dir is empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.json")).await.unwrap();
        assert_eq!(settings.max_concurrent_downloads, 4);
    }

    #[tokio::test]
    async fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grabbit.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_settings(&path).await.unwrap_err();
        assert!(matches!(err, GrabbitError::Config(_)));
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grabbit.json");
        std::fs::write(&path, r#"{ "max_concurrent_downloads": 0 }"#).unwrap();

        assert!(matches!(
            load_settings(&path).await,
            Err(GrabbitError::Config(_))
        ));
    }
}
