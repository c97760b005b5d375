//! Loading `emblem.toml`.
//!
//! A missing file is not an error: the engine runs on defaults and says so.
//! A present file must parse and validate.

use emblem_core::{EmblemConfig, EmblemError, EmblemResult};
use std::path::Path;

/// Load the config at `path`, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> EmblemResult<EmblemConfig> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(EmblemConfig::default());
    }
    let config = parse_config(path)?;
    config.validate()?;
    tracing::info!(path = %path.display(), "Config loaded");
    Ok(config)
}

/// Read and parse a TOML config file into an [`EmblemConfig`].
pub fn parse_config(path: &Path) -> EmblemResult<EmblemConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EmblemError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        EmblemError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })
}

/// Render a config the way it would be written to `emblem.toml`.
pub fn render_config(config: &EmblemConfig) -> EmblemResult<String> {
    toml::to_string_pretty(config)
        .map_err(|e| EmblemError::Config(format!("Failed to render config: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use emblem_core::OverflowPolicy;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
[planner]
max_rounds = 5
required_timeout_secs = 10
job_ttl_secs = 600

[arbiter]
required_kinds = ["structure", "aesthetic", "legibility"]

[arbiter.thresholds]
clarity = 75
aesthetic = 70
recognizability = 85
max_structure_penalty = 15

[bus]
queue_capacity = 1024
overflow = "drop_newest"
"#
        )
        .unwrap();

        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.planner.max_rounds, 5);
        assert_eq!(config.planner.required_timeout_secs, 10);
        assert_eq!(config.planner.optional_timeout_secs, 5);
        assert_eq!(config.planner.job_ttl_secs, Some(600));
        assert_eq!(config.arbiter.required_kinds.len(), 3);
        assert_eq!(config.arbiter.thresholds.clarity, 75.0);
        assert_eq!(config.arbiter.thresholds.max_structure_penalty, 15.0);
        assert_eq!(config.bus.queue_capacity, Some(1024));
        assert_eq!(config.bus.overflow, OverflowPolicy::DropNewest);
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut()).unwrap();
        assert_eq!(load_config(tmp.path()).unwrap(), EmblemConfig::default());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("emblem.toml")).unwrap();
        assert_eq!(config, EmblemConfig::default());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "{{{{invalid toml!!!!").unwrap();
        let err = load_config(tmp.path()).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config"), "unexpected error: {err}");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "[planner]\nmax_rounds = 0").unwrap();
        let err = load_config(tmp.path()).unwrap_err();
        assert!(matches!(err, EmblemError::Config(_)));
    }

    #[test]
    fn test_rendered_config_reloads() {
        let mut config = EmblemConfig::default();
        config.planner.max_rounds = 4;
        config.bus.queue_capacity = Some(64);
        let rendered = render_config(&config).unwrap();
        assert!(rendered.contains("[planner]"));
        assert!(!rendered.contains("job_ttl_secs"));

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp.as_file_mut(), "{rendered}").unwrap();
        assert_eq!(load_config(tmp.path()).unwrap(), config);
    }
}
