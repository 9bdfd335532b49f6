//! Line-per-result output in the style of classic xUnit runners.

use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use console::{StyledObject, style};

use super::{Output, Reporter, RunSummary, Tally, emit};
use crate::framework::{ResultKind, Test, TestKind};

const RULE_WIDTH: usize = 60;

/// Prints `name ... ok` per result with failure banners, then a summary with
/// elapsed time and an `OK` / `FAILED (...)` status line.
///
/// Path tests are discovery plumbing and never shown or counted.
pub struct VerboseReporter {
    output: Output,
    tally: Tally,
    found: AtomicUsize,
}

impl VerboseReporter {
    pub fn new(output: impl Write + Send + 'static) -> Self {
        Self {
            output: Mutex::new(Box::new(output)),
            tally: Tally::default(),
            found: AtomicUsize::new(0),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Short label, plural description, and styled label for a kind.
    fn describe(kind: ResultKind) -> (&'static str, &'static str, StyledObject<&'static str>) {
        match kind {
            ResultKind::Success => ("ok", "ok", style("ok").green()),
            ResultKind::Fail => ("FAIL", "failures", style("FAIL").red()),
            ResultKind::Error => ("ERROR", "errors", style("ERROR").red()),
            ResultKind::ExpectedFail => (
                "Expected Failure",
                "expected failures",
                style("Expected Failure").yellow(),
            ),
            ResultKind::Skip => ("SKIP", "skipped", style("SKIP").blue()),
            ResultKind::Unhandled => ("UNHANDLED", "unhandled", style("UNHANDLED").red().bold()),
        }
    }
}

#[async_trait]
impl Reporter for VerboseReporter {
    async fn on_test_found(&self, test: &Test) {
        if test.kind() != TestKind::Path {
            self.found.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn on_test_start(&self, _test: &Test) {
        self.tally.record_start();
    }

    async fn on_test_stop(&self, _test: &Test) {
        self.tally.record_stop();
    }

    async fn on_result(&self, test: &Test, kind: ResultKind, detail: &[String]) {
        if test.kind() == TestKind::Path {
            return;
        }
        self.tally.record_result(kind);

        let name = test.standard_form();
        let (label, _, styled) = Self::describe(kind);
        let mut text = format!("{} ... {}\n", name, styled);
        if !detail.is_empty() {
            let rule = "-".repeat(RULE_WIDTH);
            text.push_str(&format!(
                "\n{}\n{}: {}\n{}\n{}\n{}\n",
                "=".repeat(RULE_WIDTH),
                label,
                name,
                rule,
                detail.join("\n"),
                rule
            ));
        }
        emit(&self.output, &text);
    }

    async fn on_error(&self, messages: &[String]) {
        self.tally.record_error();
        emit(
            &self.output,
            &format!("{}\n{}\n", style("Unexpected Error").bold(), messages.join("\n")),
        );
    }

    async fn on_totals(&self) {
        let summary = self.tally.summary();
        let seconds = summary.elapsed.map(|d| d.as_secs_f64()).unwrap_or(0.0);

        let mut text = "-".repeat(RULE_WIDTH);
        text.push_str(&format!(
            "\nRan {} tests in {} seconds\n",
            style(self.found.load(Ordering::SeqCst)).bold(),
            style(format!("{:.3}", seconds)).bold()
        ));

        let status = if summary.success() { "OK" } else { "FAILED" };
        let counts: Vec<String> = ResultKind::ALL
            .into_iter()
            .filter(|k| *k != ResultKind::Success && summary.count(*k) > 0)
            .map(|k| format!("{}={}", Self::describe(k).1, summary.count(k)))
            .collect();
        if counts.is_empty() {
            text.push_str(&format!("{}\n", status));
        } else {
            text.push_str(&format!("{} ({})\n", status, counts.join(", ")));
        }
        emit(&self.output, &text);
    }

    fn summary(&self) -> RunSummary {
        self.tally.summary()
    }
}
