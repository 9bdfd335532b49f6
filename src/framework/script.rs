//! Script discovery and execution.
//!
//! [`ScriptFileRunner`] claims files whose name matches a glob and turns them
//! into [`Test::Script`] items. [`ScriptRunner`] executes those scripts with a
//! configured interpreter and reports their outcome.
//!
//! # Outcome mapping
//!
//! When the script prints TAP (`ok 1 - name`, `not ok 2 - name # TODO`),
//! each TAP line is reported as its own case:
//!
//! | TAP line | Result |
//! |----------|--------|
//! | `ok` | success |
//! | `ok ... # SKIP` | skip |
//! | `not ok ... # TODO` | expectedfail |
//! | `not ok` | fail |
//!
//! Otherwise the exit status decides: `0` is success, `77` is skip, any
//! other status is a failure, and death by signal is an error.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{ResultKind, Runner, Test, TestKind};
use crate::bus::Bus;
use crate::config::DiscoveryConfig;
use crate::orchestrator::SubtestBus;

/// Exit status conventionally used by test scripts to signal a skip.
pub const SKIP_EXIT_CODE: i32 = 77;

/// Translates a shell glob into an anchored regular expression.
///
/// Supports `*` and `?`; every other character matches literally.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// Claims script files and posts them as runnable [`Test::Script`] items.
#[derive(Debug)]
pub struct ScriptFileRunner {
    pattern: Regex,
}

impl ScriptFileRunner {
    /// Creates a runner for files whose name matches `glob`.
    pub fn new(glob: &str) -> anyhow::Result<Self> {
        let pattern =
            glob_to_regex(glob).with_context(|| format!("Invalid script pattern: {}", glob))?;
        Ok(Self { pattern })
    }
}

#[async_trait]
impl Runner for ScriptFileRunner {
    fn name(&self) -> &str {
        "script-file"
    }

    fn kinds(&self) -> &[TestKind] {
        &[TestKind::Path]
    }

    fn refine(&self, test: &Test) -> bool {
        let path = test.location();
        path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| self.pattern.is_match(name))
    }

    async fn run(&self, bus: &Bus, test: &Test) -> anyhow::Result<()> {
        bus.found_test(&Test::script(test.location())).await?;
        Ok(())
    }
}

/// Executes script tests.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: String,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            config.interpreter.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn execute(&self, path: &Path) -> std::io::Result<Option<std::process::Output>> {
        let mut command = tokio::process::Command::new(&self.interpreter);
        command
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl Runner for ScriptRunner {
    fn name(&self) -> &str {
        "script"
    }

    fn kinds(&self) -> &[TestKind] {
        &[TestKind::Script]
    }

    async fn run(&self, bus: &Bus, test: &Test) -> anyhow::Result<()> {
        let path = std::path::absolute(test.location())
            .with_context(|| format!("Failed to resolve {}", test.location().display()))?;
        debug!(script = %path.display(), "Running script");

        let output = match self.execute(&path).await {
            Ok(Some(output)) => output,
            Ok(None) => {
                let detail = format!("Timed out after {}s", self.timeout.as_secs());
                bus.report_result(test, ResultKind::Error, &[detail])
                    .await?;
                return Ok(());
            }
            Err(e) => {
                let detail = vec!["Unspawnable script".to_string(), e.to_string()];
                bus.report_result(test, ResultKind::Error, &detail).await?;
                return Ok(());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let cases = parse_tap(&stdout);

        if cases.is_empty() {
            let (kind, detail) = classify_exit(output.status.code(), &stdout, &stderr);
            bus.report_result(test, kind, &detail).await?;
            return Ok(());
        }

        for (index, case) in cases.iter().enumerate() {
            let case_test = test.with_case(case.number);
            if index > 0 {
                bus.report_test(&case_test).await?;
            }
            let mut detail = Vec::new();
            if case.kind() == ResultKind::Fail {
                if !case.description.is_empty() {
                    detail.push(case.description.clone());
                }
                if !stderr.trim().is_empty() {
                    detail.push(stderr.trim_end().to_string());
                }
            }
            bus.report_result(&case_test, case.kind(), &detail).await?;
        }

        let any_failed = cases.iter().any(|c| c.kind() == ResultKind::Fail);
        if !output.status.success() && !any_failed {
            let detail = vec![
                format!("{} after TAP output", describe_status(output.status.code())),
                stderr.trim_end().to_string(),
            ];
            bus.report_result(test, ResultKind::Error, &detail).await?;
        }
        Ok(())
    }
}

fn describe_status(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("Exited with status {}", code),
        None => "Terminated by signal".to_string(),
    }
}

/// Maps a plain (non-TAP) script run to a result and its detail lines.
fn classify_exit(code: Option<i32>, stdout: &str, stderr: &str) -> (ResultKind, Vec<String>) {
    match code {
        Some(0) => (ResultKind::Success, Vec::new()),
        Some(SKIP_EXIT_CODE) => (ResultKind::Skip, Vec::new()),
        Some(_) => {
            let mut detail = vec![describe_status(code)];
            for (label, text) in [("stdout:", stdout), ("stderr:", stderr)] {
                if !text.trim().is_empty() {
                    detail.push(label.to_string());
                    detail.push(text.trim_end().to_string());
                }
            }
            (ResultKind::Fail, detail)
        }
        None => (ResultKind::Error, vec![describe_status(None)]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Skip,
    Todo,
}

/// One `ok` / `not ok` line of TAP output.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TapCase {
    number: u32,
    ok: bool,
    directive: Option<Directive>,
    description: String,
}

impl TapCase {
    fn kind(&self) -> ResultKind {
        match (self.ok, self.directive) {
            (true, Some(Directive::Skip)) => ResultKind::Skip,
            (true, _) => ResultKind::Success,
            (false, Some(Directive::Todo)) => ResultKind::ExpectedFail,
            (false, _) => ResultKind::Fail,
        }
    }
}

static TAP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(not )?ok\b[ \t]*(\d+)?[ \t]*(?:-[ \t]*)?([^#]*?)[ \t]*(?:#[ \t]*(\S+)[^\n]*)?$")
        .expect("TAP line pattern is valid")
});

/// Extracts test lines from TAP output. Cases without an explicit number are
/// numbered after the previous case.
fn parse_tap(output: &str) -> Vec<TapCase> {
    let mut cases = Vec::new();
    let mut last: u32 = 0;
    for line in output.lines() {
        let Some(caps) = TAP_LINE.captures(line.trim_end()) else {
            continue;
        };
        let number = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(last.saturating_add(1));
        last = number;

        let directive = caps.get(4).and_then(|m| {
            let word = m.as_str().to_ascii_lowercase();
            if word.starts_with("skip") {
                Some(Directive::Skip)
            } else if word.starts_with("todo") {
                Some(Directive::Todo)
            } else {
                None
            }
        });

        cases.push(TapCase {
            number,
            ok: caps.get(1).is_none(),
            directive,
            description: caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        });
    }
    cases
}
