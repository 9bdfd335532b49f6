//! subtest: recursive, parallel test discovery and execution over a
//! message bus.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Bus**: Named-message dispatch to handlers, inline or pooled
//! - **Framework**: Test records, runners, and filters
//! - **Orchestrator**: The handler that filters tests and drives runners
//! - **Report**: Result sinks (terse, verbose, JUnit XML)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use subtest::bus::{Bus, Handler};
//! use subtest::framework::{DirectoryRunner, Runner, ScriptFileRunner, ScriptRunner, Test};
//! use subtest::orchestrator::{SUBTEST_MESSAGES, SubtestBus, TestCaseHandler};
//! use subtest::report::{Reporter, ResultHandler, TerseReporter};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runners: Vec<Box<dyn Runner>> = vec![
//!         Box::new(DirectoryRunner::new()),
//!         Box::new(ScriptFileRunner::new("test_*.sh")?),
//!         Box::new(ScriptRunner::new("/bin/sh", std::time::Duration::from_secs(60))),
//!     ];
//!     let reporter: Arc<dyn Reporter> = Arc::new(TerseReporter::stdout());
//!     let handlers: Vec<Arc<dyn Handler>> = vec![
//!         Arc::new(TestCaseHandler::new(Vec::new(), runners)),
//!         Arc::new(ResultHandler::new(reporter.clone())),
//!     ];
//!
//!     let bus = Bus::new(SUBTEST_MESSAGES, handlers, 4);
//!     bus.found_test(&Test::path("tests")).await?;
//!     bus.join().await;
//!     bus.report_totals().await?;
//!     bus.join().await;
//!     bus.close().await;
//!     std::process::exit(reporter.summary().exit_code());
//! }
//! ```

pub mod bus;
pub mod config;
pub mod framework;
pub mod orchestrator;
pub mod report;

// Re-export commonly used types
pub use bus::{Bus, BusError, Handler, Message};
pub use config::{Config, load_config};
pub use framework::{ResultKind, Runner, Test};
pub use orchestrator::{SubtestBus, TestCaseHandler};
pub use report::{Reporter, RunSummary};
