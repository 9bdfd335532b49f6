//! Compact progress output: one character per result.

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use console::style;

use super::{Output, Reporter, RunSummary, Tally, emit};
use crate::framework::{ResultKind, Test, TestKind};

/// Prints `.`, `F`, `E`, `X`, `s` or `U` per result, detail blocks inline,
/// and a one-line count on totals.
///
/// Unhandled path tests are ignored: most files in a tree are not tests.
pub struct TerseReporter {
    output: Output,
    tally: Tally,
}

impl TerseReporter {
    pub fn new(output: impl Write + Send + 'static) -> Self {
        Self {
            output: Mutex::new(Box::new(output)),
            tally: Tally::default(),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    fn code(kind: ResultKind) -> char {
        match kind {
            ResultKind::Success => '.',
            ResultKind::Fail => 'F',
            ResultKind::Error => 'E',
            ResultKind::ExpectedFail => 'X',
            ResultKind::Skip => 's',
            ResultKind::Unhandled => 'U',
        }
    }

    fn ignored(test: &Test, kind: ResultKind) -> bool {
        kind == ResultKind::Unhandled && test.kind() == TestKind::Path
    }

    fn block(&self, title: &str, lines: &[String]) {
        emit(
            &self.output,
            &format!("\n{}\n{}\n", style(title).bold(), lines.join("\n")),
        );
    }
}

#[async_trait]
impl Reporter for TerseReporter {
    async fn on_result(&self, test: &Test, kind: ResultKind, detail: &[String]) {
        if Self::ignored(test, kind) {
            return;
        }
        self.tally.record_result(kind);
        emit(&self.output, &Self::code(kind).to_string());
        if !detail.is_empty() {
            self.block(&test.standard_form(), detail);
        }
    }

    async fn on_error(&self, messages: &[String]) {
        self.tally.record_error();
        self.block("Unexpected Error", messages);
    }

    async fn on_totals(&self) {
        let summary = self.tally.summary();
        let mut parts = vec![format!("Ran: {} tests", summary.total)];
        for kind in ResultKind::ALL {
            let count = summary.count(kind);
            if count > 0 {
                parts.push(format!("{}: {}", kind, count));
            }
        }
        emit(&self.output, &format!("\n{}\n", parts.join(", ")));
    }

    fn summary(&self) -> RunSummary {
        self.tally.summary()
    }
}
