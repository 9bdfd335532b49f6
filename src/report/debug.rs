//! Trace-style output of every report event.

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use console::style;

use super::{Output, Reporter, RunSummary, Tally, emit};
use crate::framework::{ResultKind, Test, TestKind};

/// Prints `Starting:` / `Stopping:` around every runner invocation and one
/// `Test(...): kind` line per result, using the full record rendering.
///
/// Nothing is hidden, including unhandled path tests, but those are left out
/// of the summary the same way the other sinks leave them out.
pub struct DebugReporter {
    output: Output,
    tally: Tally,
}

impl DebugReporter {
    pub fn new(output: impl Write + Send + 'static) -> Self {
        Self {
            output: Mutex::new(Box::new(output)),
            tally: Tally::default(),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    fn block(&self, title: &str, lines: &[String]) {
        emit(
            &self.output,
            &format!("{}\n{}\n", style(title).bold(), lines.join("\n")),
        );
    }
}

#[async_trait]
impl Reporter for DebugReporter {
    async fn on_test_start(&self, test: &Test) {
        self.tally.record_start();
        emit(&self.output, &format!("Starting: {}\n", test));
    }

    async fn on_test_stop(&self, test: &Test) {
        self.tally.record_stop();
        emit(&self.output, &format!("Stopping: {}\n", test));
    }

    async fn on_result(&self, test: &Test, kind: ResultKind, detail: &[String]) {
        if !(kind == ResultKind::Unhandled && test.kind() == TestKind::Path) {
            self.tally.record_result(kind);
        }
        emit(&self.output, &format!("{}: {}\n", test, kind));
        if !detail.is_empty() {
            self.block(&test.standard_form(), detail);
        }
    }

    async fn on_error(&self, messages: &[String]) {
        self.tally.record_error();
        self.block("Unexpected Error", messages);
    }

    async fn on_totals(&self) {}

    fn summary(&self) -> RunSummary {
        self.tally.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::SharedBuffer;

    #[tokio::test]
    async fn test_start_stop_and_result_lines() {
        console::set_colors_enabled(false);
        let buffer = SharedBuffer::new();
        let reporter = DebugReporter::new(buffer.clone());
        let test = Test::script("suite/test_a.sh");

        reporter.on_test_start(&test).await;
        reporter
            .on_result(&test, ResultKind::Fail, &["Exited with status 1".to_string()])
            .await;
        reporter.on_test_stop(&test).await;

        assert_eq!(
            buffer.contents(),
            concat!(
                "Starting: ScriptTest(\"suite/test_a.sh\", None)\n",
                "ScriptTest(\"suite/test_a.sh\", None): fail\n",
                "suite/test_a.sh\nExited with status 1\n",
                "Stopping: ScriptTest(\"suite/test_a.sh\", None)\n",
            )
        );
        assert_eq!(reporter.summary().exit_code(), 1);
    }

    #[tokio::test]
    async fn test_unhandled_paths_shown_but_not_counted() {
        console::set_colors_enabled(false);
        let buffer = SharedBuffer::new();
        let reporter = DebugReporter::new(buffer.clone());

        reporter
            .on_result(&Test::path("README"), ResultKind::Unhandled, &[])
            .await;
        reporter.on_totals().await;

        assert_eq!(buffer.contents(), "PathTest(\"README\"): unhandled\n");
        assert!(reporter.summary().success());
        assert_eq!(reporter.summary().total, 0);
    }
}
