use crate::models::settings::Settings;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound on the configuration file size. A gateway config past this
/// is a deployment mistake, not a bigger gateway.
const MAX_SIZE_BYTES: u64 = 8 * 1024 * 1024;

/// Failures while locating, reading, or parsing the configuration file.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration file '{0}' not found")]
    NotFound(PathBuf),
    #[error("configuration file '{path}' resolves outside the working directory")]
    OutsideWorkdir { path: PathBuf },
    #[error("configuration file is {actual} bytes, the limit is {limit}")]
    TooLarge { actual: u64, limit: u64 },
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration path from `ARCUS_CONFIG_PATH`, defaulting to
/// `./config.json`.
pub fn config_path() -> PathBuf {
    std::env::var_os("ARCUS_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./config.json"))
}

/// Loads gateway settings from the configured path.
pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from(&config_path())
}

/// Loads and parses gateway settings from a JSON file.
///
/// The path must resolve (symlinks included) to somewhere inside the
/// working directory and the file must stay under [`MAX_SIZE_BYTES`].
pub fn load_settings_from(path: &Path) -> Result<Settings, SettingsError> {
    if !path.exists() {
        return Err(SettingsError::NotFound(path.to_path_buf()));
    }

    let resolved = fs::canonicalize(path)?;
    let workdir = std::env::current_dir()?;
    if !resolved.starts_with(&workdir) {
        warn!(
            "refusing configuration outside the working directory: {}",
            resolved.display()
        );
        return Err(SettingsError::OutsideWorkdir { path: resolved });
    }

    let size = fs::metadata(&resolved)?.len();
    if size > MAX_SIZE_BYTES {
        return Err(SettingsError::TooLarge {
            actual: size,
            limit: MAX_SIZE_BYTES,
        });
    }

    let raw = fs::read_to_string(&resolved)?;
    let settings: Settings = serde_json::from_str(&raw)?;

    debug!(
        "configuration loaded from {}: {} backends, {} routes, {} tenants",
        resolved.display(),
        settings.backend_services.len(),
        settings.routes.len(),
        settings.tenants.len()
    );

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config() {
        let dir = std::env::current_dir().unwrap();
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile_in(&dir)
            .unwrap();
        write!(
            file,
            r#"{{"version": 1, "backend_services": {{"users": "http://localhost:9000"}}, "routes": {{"/api/*": "users"}}}}"#
        )
        .unwrap();

        let settings = load_settings_from(file.path()).unwrap();
        assert_eq!(settings.version, 1);
        assert_eq!(
            settings.backend_services.get("users").map(String::as_str),
            Some("http://localhost:9000")
        );
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load_settings_from(Path::new("./definitely-not-here.json")).unwrap_err();
        assert!(matches!(err, SettingsError::NotFound(_)));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let dir = std::env::current_dir().unwrap();
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile_in(&dir)
            .unwrap();
        write!(file, "{{not json").unwrap();

        let err = load_settings_from(file.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
    }
}
