//! JUnit XML report generation.
//!
//! Results are collected while the run progresses and written as a single
//! file when totals are requested. The output is what CI systems expect:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="0" time="1.234">
//!   <testsuite name="subtest" tests="3" failures="1" errors="0" skipped="1" time="1.234" timestamp="...">
//!     <testcase classname="suite" name="test_add.sh" time="0.100"/>
//!     <testcase classname="suite" name="test_sub.sh(2)" time="0.150">
//!       <failure message="not ok 2 - subtracts" type="fail">not ok 2 - subtracts</failure>
//!     </testcase>
//!     <testcase classname="suite" name="test_mul.sh" time="0.050">
//!       <skipped/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! # Example
//!
//! ```
//! use subtest::report::JUnitReporter;
//!
//! let reporter = JUnitReporter::new("test-results/junit.xml".into())
//!     .with_testsuite_name("my-project-tests");
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Reporter, RunSummary, Tally};
use crate::framework::{ResultKind, Test, TestKind};

#[derive(Debug, Clone)]
struct CaseRecord {
    test: Test,
    kind: ResultKind,
    detail: Vec<String>,
}

#[derive(Debug, Default)]
struct Timings {
    started: HashMap<PathBuf, Instant>,
    durations: HashMap<PathBuf, Duration>,
}

/// Reporter that writes a JUnit XML file once the run completes.
///
/// Path tests are discovery plumbing and never appear in the file. Parent
/// directories of the output path are created as needed.
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
    started_at: DateTime<Local>,
    cases: Mutex<Vec<CaseRecord>>,
    timings: Mutex<Timings>,
    tally: Tally,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuite_name: "subtest".to_string(),
            started_at: Local::now(),
            cases: Mutex::new(Vec::new()),
            timings: Mutex::new(Timings::default()),
            tally: Tally::default(),
        }
    }

    /// Sets the test suite name in the XML output. Defaults to `"subtest"`.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn duration_of(&self, test: &Test) -> Duration {
        self.timings
            .lock()
            .ok()
            .and_then(|t| t.durations.get(test.location()).copied())
            .unwrap_or_default()
    }

    fn generate_xml(&self) -> anyhow::Result<String> {
        let cases = self
            .cases
            .lock()
            .map(|c| c.clone())
            .map_err(|_| anyhow::anyhow!("JUnit results poisoned"))?;
        let summary = self.tally.summary();

        let count = |kind: ResultKind| cases.iter().filter(|c| c.kind == kind).count();
        let tests = cases.len().to_string();
        let failures = count(ResultKind::Fail).to_string();
        let errors = (count(ResultKind::Error) + count(ResultKind::Unhandled)).to_string();
        let skipped = (count(ResultKind::Skip) + count(ResultKind::ExpectedFail)).to_string();
        let time = format!(
            "{:.3}",
            summary.elapsed.map(|d| d.as_secs_f64()).unwrap_or(0.0)
        );
        let timestamp = self.started_at.format("%Y-%m-%dT%H:%M:%S").to_string();

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", skipped.as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", timestamp.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for case in &cases {
            self.write_testcase(&mut writer, case)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_testcase<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        case: &CaseRecord,
    ) -> anyhow::Result<()> {
        let (classname, name) = split_name(&case.test);

        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", classname.as_str()));
        testcase.push_attribute(("name", name.as_str()));
        testcase.push_attribute((
            "time",
            format!("{:.3}", self.duration_of(&case.test).as_secs_f64()).as_str(),
        ));

        let element = match case.kind {
            ResultKind::Success => None,
            ResultKind::Fail => Some("failure"),
            ResultKind::Error | ResultKind::Unhandled => Some("error"),
            ResultKind::Skip | ResultKind::ExpectedFail => Some("skipped"),
        };
        let Some(element) = element else {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        };

        writer.write_event(Event::Start(testcase))?;

        let mut child = BytesStart::new(element);
        let message = sanitize(case.detail.first().map(String::as_str).unwrap_or_default());
        if !message.is_empty() {
            child.push_attribute(("message", message.as_str()));
        }
        if element != "skipped" {
            child.push_attribute(("type", case.kind.as_str()));
        }

        if case.detail.is_empty() {
            writer.write_event(Event::Empty(child))?;
        } else {
            writer.write_event(Event::Start(child))?;
            let body = sanitize(&case.detail.join("\n"));
            writer.write_event(Event::Text(BytesText::new(&body)))?;
            writer.write_event(Event::End(BytesEnd::new(element)))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        Ok(())
    }

    fn write_file(&self) -> anyhow::Result<()> {
        let xml = self.generate_xml()?;
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, xml)?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_test_start(&self, test: &Test) {
        self.tally.record_start();
        if let Ok(mut timings) = self.timings.lock() {
            timings
                .started
                .insert(test.location().to_path_buf(), Instant::now());
        }
    }

    async fn on_test_stop(&self, test: &Test) {
        self.tally.record_stop();
        if let Ok(mut timings) = self.timings.lock()
            && let Some(start) = timings.started.remove(test.location())
        {
            timings
                .durations
                .insert(test.location().to_path_buf(), start.elapsed());
        }
    }

    async fn on_result(&self, test: &Test, kind: ResultKind, detail: &[String]) {
        if test.kind() == TestKind::Path {
            return;
        }
        self.tally.record_result(kind);
        if let Ok(mut cases) = self.cases.lock() {
            cases.push(CaseRecord {
                test: test.clone(),
                kind,
                detail: detail.to_vec(),
            });
        }
    }

    async fn on_error(&self, messages: &[String]) {
        self.tally.record_error();
        tracing::error!("{}", messages.join("\n"));
    }

    async fn on_totals(&self) {
        match self.write_file() {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {:#}", e),
        }
    }

    fn summary(&self) -> RunSummary {
        self.tally.summary()
    }
}

/// Splits a test into `(classname, name)`: the parent directory with
/// separators turned into dots, and the file name plus any case number.
fn split_name(test: &Test) -> (String, String) {
    let location = test.location();
    let classname = location
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(".")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let file = location
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| location.display().to_string());
    let name = match test {
        Test::Script(t) => match t.case {
            Some(case) => format!("{}({})", file, case),
            None => file,
        },
        Test::Path(_) => file,
    };
    (classname, name)
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}
