//! Test orchestration over the bus.
//!
//! The [`TestCaseHandler`] is the handler behind `found_test` and
//! `add_test`. It filters discovered tests, hands runnable ones to every
//! claiming [`Runner`], and reports structured results. Runners call back
//! into the bus to post newly discovered tests, which is what makes the
//! discovery recursive.
//!
//! # Message Flow
//!
//! ```text
//!   found_test(test)
//!       │ filter chain rejects ──► report_result(test, skip)
//!       ▼
//!   add_test(test) ──► for each claiming runner:
//!       │                  report_start(test)
//!       │                  runner.run(bus, test) ──► found_test(child) ...
//!       │                  report_stop(test)
//!       │              no claimant ──► report_result(test, unhandled)
//!       ▼
//!   report_test(test)
//! ```
//!
//! # Failure Reporting
//!
//! Any error or panic inside `found_test` / `add_test` is formatted and
//! posted on the `error` channel, then returned as
//! [`HandlerError::Reported`]. Nested inline calls see the reported marker
//! and do not post the same failure twice.

use std::panic::AssertUnwindSafe;

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::bus::pool::panic_message;
use crate::bus::{Bus, BusResult, Handler, HandlerError, HandlerResult, Message, MessageTypes};
use crate::framework::{Filter, ResultKind, Runner, Test};

pub const FOUND_TEST: &str = "found_test";
pub const ADD_TEST: &str = "add_test";
pub const REPORT_TEST: &str = "report_test";
pub const REPORT_RESULT: &str = "report_result";
pub const REPORT_START: &str = "report_start";
pub const REPORT_STOP: &str = "report_stop";
pub const REPORT_TOTALS: &str = "report_totals";
pub const ERROR: &str = "error";

/// Every message a subtest bus accepts.
pub const SUBTEST_MESSAGES: MessageTypes = &[
    FOUND_TEST,
    ADD_TEST,
    REPORT_TEST,
    REPORT_RESULT,
    REPORT_START,
    REPORT_STOP,
    REPORT_TOTALS,
    ERROR,
];

/// Typed helpers for posting the subtest message set.
#[async_trait]
pub trait SubtestBus {
    async fn found_test(&self, test: &Test) -> BusResult<()>;
    async fn add_test(&self, test: &Test) -> BusResult<()>;
    async fn report_test(&self, test: &Test) -> BusResult<()>;
    async fn report_result(&self, test: &Test, kind: ResultKind, detail: &[String])
    -> BusResult<()>;
    async fn report_start(&self, test: &Test) -> BusResult<()>;
    async fn report_stop(&self, test: &Test) -> BusResult<()>;
    async fn report_totals(&self) -> BusResult<()>;
    async fn error(&self, messages: &[String]) -> BusResult<()>;
}

#[async_trait]
impl SubtestBus for Bus {
    async fn found_test(&self, test: &Test) -> BusResult<()> {
        self.post(Message::new(FOUND_TEST).with_arg(test)?).await
    }

    async fn add_test(&self, test: &Test) -> BusResult<()> {
        self.post(Message::new(ADD_TEST).with_arg(test)?).await
    }

    async fn report_test(&self, test: &Test) -> BusResult<()> {
        self.post(Message::new(REPORT_TEST).with_arg(test)?).await
    }

    async fn report_result(
        &self,
        test: &Test,
        kind: ResultKind,
        detail: &[String],
    ) -> BusResult<()> {
        let mut message = Message::new(REPORT_RESULT).with_arg(test)?.with_arg(&kind)?;
        for line in detail {
            message = message.with_arg(line)?;
        }
        self.post(message).await
    }

    async fn report_start(&self, test: &Test) -> BusResult<()> {
        self.post(Message::new(REPORT_START).with_arg(test)?).await
    }

    async fn report_stop(&self, test: &Test) -> BusResult<()> {
        self.post(Message::new(REPORT_STOP).with_arg(test)?).await
    }

    async fn report_totals(&self) -> BusResult<()> {
        self.post(Message::new(REPORT_TOTALS)).await
    }

    async fn error(&self, messages: &[String]) -> BusResult<()> {
        let mut message = Message::new(ERROR);
        for line in messages {
            message = message.with_arg(line)?;
        }
        self.post(message).await
    }
}

/// Filters discovered tests and drives runners over accepted ones.
pub struct TestCaseHandler {
    filters: Vec<Box<dyn Filter>>,
    runners: Vec<Box<dyn Runner>>,
}

impl TestCaseHandler {
    pub fn new(filters: Vec<Box<dyn Filter>>, runners: Vec<Box<dyn Runner>>) -> Self {
        Self { filters, runners }
    }

    async fn found_test(&self, bus: &Bus, test: Test) -> HandlerResult<()> {
        if let Some(index) = self.filters.iter().position(|f| !f.admit(&test)) {
            debug!(%test, filter = index, "Test rejected by filter");
            bus.report_result(&test, ResultKind::Skip, &[]).await?;
            return Ok(());
        }
        bus.add_test(&test).await?;
        bus.report_test(&test).await?;
        Ok(())
    }

    async fn add_test(&self, bus: &Bus, test: Test) -> HandlerResult<()> {
        let mut handled = false;
        for runner in self.runners.iter().filter(|r| r.handles(&test)) {
            debug!(%test, runner = runner.name(), "Running test");
            bus.report_start(&test).await?;
            runner
                .run(bus, &test)
                .await
                .with_context(|| format!("Runner {} failed on {}", runner.name(), test))?;
            bus.report_stop(&test).await?;
            handled = true;
        }
        if !handled {
            bus.report_result(&test, ResultKind::Unhandled, &[]).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, bus: &Bus, message: &Message) -> HandlerResult<()> {
        match message.name() {
            FOUND_TEST => self.found_test(bus, message.arg(0)?).await,
            ADD_TEST => self.add_test(bus, message.arg(0)?).await,
            other => Err(HandlerError::Unsupported(other.to_string())),
        }
    }
}

#[async_trait]
impl Handler for TestCaseHandler {
    fn messages(&self) -> &[&str] {
        &[FOUND_TEST, ADD_TEST]
    }

    async fn handle(&self, bus: &Bus, message: &Message) -> HandlerResult<()> {
        let failure = match AssertUnwindSafe(self.dispatch(bus, message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(payload) => HandlerError::Panicked(panic_message(payload.as_ref())),
        };
        if failure.is_reported() {
            return Err(failure);
        }

        let text = format!(
            "Uncaught exception in test handler:\n{}",
            describe_error(&failure)
        );
        if let Err(e) = bus.error(&[text.clone()]).await {
            warn!("Failed to report handler failure: {}", e);
        }
        Err(HandlerError::Reported(text))
    }
}

/// Formats an error followed by its chain of causes.
pub fn describe_error(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str("\nCaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
