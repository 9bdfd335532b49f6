//! Configuration schema definitions for subtest.
//!
//! ```text
//! Config (root)
//! ├── SubtestConfig    - Parallelism and output selection
//! ├── DiscoveryConfig  - Script matching, execution, and name filters
//! └── ReportConfig     - JUnit output settings
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [subtest]
/// jobs = 8
/// output = "terse"
///
/// [discovery]
/// script_pattern = "test_*.sh"
/// interpreter = "/bin/sh"
/// timeout_secs = 300
/// include = []
/// exclude = []
///
/// [report]
/// junit_file = "test-results/junit.xml"
/// testsuite_name = "subtest"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub subtest: SubtestConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `jobs` | None (number of CPUs) |
/// | `output` | `terse` |
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubtestConfig {
    /// Bus degree. `0` runs every handler inline on the posting task.
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Which result sink to register.
    #[serde(default)]
    pub output: OutputFormat,
}

/// Result sink selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Terse,
    Verbose,
    Junit,
    Debug,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Terse => "terse",
            OutputFormat::Verbose => "verbose",
            OutputFormat::Junit => "junit",
            OutputFormat::Debug => "debug",
        })
    }
}

/// How test scripts are found and executed.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `script_pattern` | `"test_*.sh"` |
/// | `interpreter` | `"/bin/sh"` |
/// | `timeout_secs` | 300 |
/// | `include` / `exclude` | empty |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Glob matched against file names; `*` and `?` are supported.
    #[serde(default = "default_script_pattern")]
    pub script_pattern: String,

    /// Program used to run each script.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Scripts running longer than this are killed and reported as errors.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Regexes matched against test names. Empty admits everything.
    #[serde(default)]
    pub include: Vec<String>,

    /// Regexes whose matches are skipped.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            script_pattern: default_script_pattern(),
            interpreter: default_interpreter(),
            timeout_secs: default_timeout_secs(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

fn default_script_pattern() -> String {
    "test_*.sh".to_string()
}

fn default_interpreter() -> String {
    "/bin/sh".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

/// JUnit output settings, used when `output = "junit"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Parent directories are created automatically.
    #[serde(default = "default_junit_file")]
    pub junit_file: PathBuf,

    #[serde(default = "default_testsuite_name")]
    pub testsuite_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            junit_file: default_junit_file(),
            testsuite_name: default_testsuite_name(),
        }
    }
}

fn default_junit_file() -> PathBuf {
    PathBuf::from("test-results/junit.xml")
}

fn default_testsuite_name() -> String {
    "subtest".to_string()
}
