//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into an [`OrchestratorConfig`], and
//! run validation before returning.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::OrchestratorConfig;

/// Load an [`OrchestratorConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(OrchestratorConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_file(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`OrchestratorConfig`] from a TOML string.
///
/// # Arguments
///
/// * `content` - TOML content as a string.
/// * `source_name` - Identifier for the source (used in error messages).
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[telemetry_breaker]
failure_threshold = 3
recovery_timeout_secs = 30

[deployment]
monitoring_duration_secs = 600
sampling_interval_secs = 30

[cycle]
max_improvements = 2
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test").expect("test: valid config");
        assert_eq!(config.telemetry_breaker.failure_threshold, 3);
        assert_eq!(config.deployment.sampling_interval_secs, 30);
        assert_eq!(config.cycle.max_improvements, 2);
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let result = load_from_str("not valid toml [[[", "bad.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_unknown_type_returns_parse_error() {
        let result = load_from_str("[cycle]\nmax_improvements = \"three\"\n", "typed.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_validation_failure_returns_validation_error() {
        let result = load_from_str("[buffer]\ncapacity_per_tenant = 0\n", "zero.toml");
        match result {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("buffer.capacity_per_tenant"))
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_valid_toml_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("autoimprove.toml");
        let mut f = std::fs::File::create(&path).expect("test: create file");
        f.write_all(VALID_TOML.as_bytes()).expect("test: write");
        drop(f);

        let config = load_from_file(&path).expect("test: load from file");
        assert_eq!(config.cycle.max_improvements, 2);
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let result = load_from_file(Path::new("/nonexistent/path/autoimprove.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_from_file_empty_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "").expect("test: write");

        let config = load_from_file(&path).expect("test: empty file is valid");
        assert_eq!(config, OrchestratorConfig::default());
    }
}
