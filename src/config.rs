//! Configuration loading and schema definitions for subtest.
//!
//! Every section and field is optional; a missing file is the same as an
//! empty one. Command-line flags override whatever is loaded here.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
///
/// # Example
///
/// ```no_run
/// use subtest::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("subtest.toml"))?;
/// println!("Timeout: {}s", config.discovery.timeout_secs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use subtest::config::{OutputFormat, load_config_str};
///
/// let config = load_config_str(r#"
///     [subtest]
///     jobs = 4
///     output = "verbose"
/// "#)?;
///
/// assert_eq!(config.subtest.jobs, Some(4));
/// assert_eq!(config.subtest.output, OutputFormat::Verbose);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads `path` if it exists, otherwise returns the defaults.
pub fn load_optional(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!("No config file at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.subtest.jobs, None);
        assert_eq!(config.subtest.output, OutputFormat::Terse);
        assert_eq!(config.discovery.script_pattern, "test_*.sh");
        assert_eq!(config.discovery.interpreter, "/bin/sh");
        assert_eq!(config.discovery.timeout_secs, 300);
        assert_eq!(
            config.report.junit_file,
            std::path::PathBuf::from("test-results/junit.xml")
        );
        assert_eq!(config.report.testsuite_name, "subtest");
    }

    #[test]
    fn test_partial_sections() {
        let config = load_config_str(
            r#"
            [discovery]
            script_pattern = "*_test.sh"
            exclude = ["slow"]

            [report]
            testsuite_name = "nightly"
            "#,
        )
        .unwrap();
        assert_eq!(config.discovery.script_pattern, "*_test.sh");
        assert_eq!(config.discovery.exclude, vec!["slow".to_string()]);
        assert!(config.discovery.include.is_empty());
        assert_eq!(config.discovery.timeout_secs, 300);
        assert_eq!(config.report.testsuite_name, "nightly");
    }

    #[test]
    fn test_debug_output() {
        let config = load_config_str("[subtest]\noutput = \"debug\"\n").unwrap();
        assert_eq!(config.subtest.output, OutputFormat::Debug);
        assert_eq!(config.subtest.output.to_string(), "debug");
    }

    #[test]
    fn test_rejects_unknown_output() {
        let result = load_config_str(
            r#"
            [subtest]
            output = "html"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_optional_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_optional(&dir.path().join("subtest.toml")).unwrap();
        assert_eq!(config.subtest.jobs, None);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subtest.toml");
        std::fs::write(&path, "[subtest]\njobs = 2\n").unwrap();
        assert_eq!(load_optional(&path).unwrap().subtest.jobs, Some(2));

        std::fs::write(&path, "[subtest\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
