//! Configuration loading.

use rosenet_types::{RoseNetConfig, RoseNetError, RoseNetResult};
use std::path::{Path, PathBuf};
use tracing::info;

/// Load configuration from disk, falling back to defaults.
///
/// A missing, unreadable, unparsable or invalid file is logged and replaced
/// by [`RoseNetConfig::default`]; this never fails.
pub fn load_config(path: Option<&Path>) -> RoseNetConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return RoseNetConfig::default();
    }

    match load_config_strict(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            RoseNetConfig::default()
        }
    }
}

/// Load and validate configuration from `path`, reporting every problem.
pub fn load_config_strict(path: &Path) -> RoseNetResult<RoseNetConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        RoseNetError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let config = RoseNetConfig::from_toml_str(&contents)?;
    config.validate()?;
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// `~/.rosenet/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".rosenet")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config, RoseNetConfig::default());
    }

    #[test]
    fn test_load_config_reads_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[direct]
max_retry_attempts = 2
max_outbound_throughput = 8

[breaker]
minimum_samples = 3
"#
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.direct.max_retry_attempts, 2);
        assert_eq!(config.direct.max_outbound_throughput, 8);
        assert_eq!(config.breaker.minimum_samples, 3);
        assert_eq!(config.direct.roundtrip_timeout_ms, 5_000);
    }

    #[test]
    fn test_invalid_values_fall_back_but_strict_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[breaker]\nfailure_threshold = 2.0\n").unwrap();

        assert_eq!(load_config(Some(&path)), RoseNetConfig::default());
        assert!(matches!(
            load_config_strict(&path),
            Err(RoseNetError::Config(_))
        ));
    }

    #[test]
    fn test_strict_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_strict(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
