//! Result sinks.
//!
//! A [`Reporter`] receives decoded report events. [`ResultHandler`] adapts
//! any reporter into a bus [`Handler`] with a worker limit of one, so output
//! is written by a single task even on a pooled bus.
//!
//! # Built-in Reporters
//!
//! | Reporter | Output |
//! |----------|--------|
//! | [`DebugReporter`] | every start, stop and result, as full records |
//! | [`TerseReporter`] | one character per result |
//! | [`VerboseReporter`] | one line per result, coloured |
//! | [`JUnitReporter`] | JUnit XML file written on totals |

pub mod debug;
pub mod junit;
pub mod terse;
pub mod verbose;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::bus::{Bus, Handler, HandlerError, HandlerResult, Message};
use crate::framework::{ResultKind, Test};
use crate::orchestrator::{
    ERROR, REPORT_RESULT, REPORT_START, REPORT_STOP, REPORT_TEST, REPORT_TOTALS,
};

pub use debug::DebugReporter;
pub use junit::JUnitReporter;
pub use terse::TerseReporter;
pub use verbose::VerboseReporter;

/// Messages understood by every result sink.
pub const REPORT_MESSAGES: &[&str] = &[
    REPORT_RESULT,
    REPORT_TEST,
    REPORT_START,
    REPORT_STOP,
    REPORT_TOTALS,
    ERROR,
];

/// Receives report events from the bus.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// A test passed the filters and was queued.
    async fn on_test_found(&self, _test: &Test) {}

    /// A runner started on a test.
    async fn on_test_start(&self, _test: &Test) {}

    /// A runner finished with a test.
    async fn on_test_stop(&self, _test: &Test) {}

    /// A terminal result arrived.
    async fn on_result(&self, test: &Test, kind: ResultKind, detail: &[String]);

    /// A handler or runner failed outside of any test result.
    async fn on_error(&self, messages: &[String]);

    /// All work is done.
    async fn on_totals(&self);

    /// Counts gathered so far.
    fn summary(&self) -> RunSummary;
}

/// Adapts a [`Reporter`] to the bus.
pub struct ResultHandler {
    reporter: Arc<dyn Reporter>,
}

impl ResultHandler {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl Handler for ResultHandler {
    fn messages(&self) -> &[&str] {
        REPORT_MESSAGES
    }

    fn worker_limit(&self) -> Option<usize> {
        Some(1)
    }

    async fn handle(&self, _bus: &Bus, message: &Message) -> HandlerResult<()> {
        match message.name() {
            REPORT_RESULT => {
                let test: Test = message.arg(0)?;
                let kind: ResultKind = message.arg(1)?;
                let detail: Vec<String> = message.rest(2)?;
                self.reporter.on_result(&test, kind, &detail).await;
            }
            REPORT_TEST => self.reporter.on_test_found(&message.arg(0)?).await,
            REPORT_START => self.reporter.on_test_start(&message.arg(0)?).await,
            REPORT_STOP => self.reporter.on_test_stop(&message.arg(0)?).await,
            REPORT_TOTALS => self.reporter.on_totals().await,
            ERROR => self.reporter.on_error(&message.rest::<String>(0)?).await,
            other => return Err(HandlerError::Unsupported(other.to_string())),
        }
        Ok(())
    }
}

/// Aggregated counts for a run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | No failures, errors, unhandled tests, or handler errors |
/// | 1 | Anything else |
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Number of results counted.
    pub total: usize,

    /// Results per kind.
    pub counts: BTreeMap<ResultKind, usize>,

    /// Messages received on the `error` channel.
    pub errors: usize,

    /// Time between the first start and the last stop.
    pub elapsed: Option<Duration>,
}

impl RunSummary {
    pub fn count(&self, kind: ResultKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Returns `true` if nothing failed.
    pub fn success(&self) -> bool {
        self.errors == 0 && !self.counts.iter().any(|(k, n)| k.is_failure() && *n > 0)
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

#[derive(Debug, Default)]
struct TallyState {
    total: usize,
    counts: BTreeMap<ResultKind, usize>,
    errors: usize,
    first_start: Option<Instant>,
    last_stop: Option<Instant>,
}

/// Thread-safe counters shared by the built-in reporters.
#[derive(Debug, Default)]
pub struct Tally {
    state: Mutex<TallyState>,
}

impl Tally {
    pub fn record_result(&self, kind: ResultKind) {
        if let Ok(mut state) = self.state.lock() {
            state.total += 1;
            *state.counts.entry(kind).or_insert(0) += 1;
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.errors += 1;
        }
    }

    pub fn record_start(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.first_start.get_or_insert_with(Instant::now);
        }
    }

    pub fn record_stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.last_stop = Some(Instant::now());
        }
    }

    pub fn summary(&self) -> RunSummary {
        self.state
            .lock()
            .map(|state| RunSummary {
                total: state.total,
                counts: state.counts.clone(),
                errors: state.errors,
                elapsed: match (state.first_start, state.last_stop) {
                    (Some(start), Some(stop)) => Some(stop.saturating_duration_since(start)),
                    _ => None,
                },
            })
            .unwrap_or_default()
    }
}

/// Output target shared between a reporter and whoever inspects it.
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| std::io::Error::other("output buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Boxed writer guarded for use from a shared reporter.
pub(crate) type Output = Mutex<Box<dyn Write + Send>>;

/// Writes `text` to `output`, logging instead of failing on I/O errors.
pub(crate) fn emit(output: &Output, text: &str) {
    let result = output.lock().map(|mut out| {
        out.write_all(text.as_bytes())
            .and_then(|()| out.flush())
    });
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Failed to write report output: {}", e),
        Err(_) => tracing::error!("Report output poisoned"),
    }
}
