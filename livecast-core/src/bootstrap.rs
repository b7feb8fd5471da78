//! Configuration loading

use anyhow::Result;
use std::path::Path;

use crate::StreamConfig;

/// Load configuration from a config file and environment variables
///
/// Config file search order:
/// 1. Explicit path (from the command line)
/// 2. `LIVECAST_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. Fall back to environment variables only
///
/// A file that fails to parse is an error, never a fallback to defaults.
pub fn load_config(explicit_path: Option<&str>) -> Result<StreamConfig> {
    if let Some(path) = explicit_path {
        if !Path::new(path).exists() {
            return Err(anyhow::anyhow!("Config file not found: {path}"));
        }
    }

    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| {
            std::env::var("LIVECAST_CONFIG_PATH")
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        StreamConfig::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        StreamConfig::from_env()?
    };

    Ok(config)
}

/// Reject an invalid configuration before any component starts
pub fn validate_config(config: &StreamConfig) -> Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_config_reports_count() {
        let err = validate_config(&StreamConfig::default()).unwrap_err();
        assert!(err.to_string().contains("1 error(s)"));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let err = load_config(Some(missing.to_str().unwrap())).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
