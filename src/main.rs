//! subtest CLI - recursive, parallel test runner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, debug, error, info};
use tracing_subscriber::FmtSubscriber;

use subtest::bus::{Bus, Handler};
use subtest::config::{self, Config, OutputFormat};
use subtest::framework::{
    DirectoryRunner, Filter, NameFilter, Runner, ScriptFileRunner, ScriptRunner, Test,
};
use subtest::orchestrator::{SUBTEST_MESSAGES, SubtestBus, TestCaseHandler};
use subtest::report::{
    DebugReporter, JUnitReporter, Reporter, ResultHandler, TerseReporter, VerboseReporter,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "subtest")]
#[command(about = "Recursive, parallel test runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Files or directories to search for tests
    #[arg(default_value = ".")]
    paths: Vec<PathBuf>,

    /// Number of workers per handler (0 runs everything inline)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Result output format
    #[arg(short, long, value_enum)]
    output: Option<Output>,

    /// JUnit XML output path
    #[arg(long)]
    junit_file: Option<PathBuf>,

    /// Only run tests whose name matches this regex (repeatable)
    #[arg(short = 'k', long)]
    include: Vec<String>,

    /// Skip tests whose name matches this regex (repeatable)
    #[arg(long)]
    exclude: Vec<String>,

    /// Configuration file path
    #[arg(short, long, default_value = "subtest.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Output {
    Terse,
    Verbose,
    Junit,
    Debug,
}

impl From<Output> for OutputFormat {
    fn from(output: Output) -> Self {
        match output {
            Output::Terse => OutputFormat::Terse,
            Output::Verbose => OutputFormat::Verbose,
            Output::Junit => OutputFormat::Junit,
            Output::Debug => OutputFormat::Debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = config::load_optional(&cli.config)?;
    apply_overrides(&mut config, &cli);

    let code = run(&cli.paths, &config).await?;
    std::process::exit(code);
}

/// Folds command-line flags into the loaded configuration.
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(jobs) = cli.jobs {
        config.subtest.jobs = Some(jobs);
    }
    if let Some(output) = cli.output {
        config.subtest.output = output.into();
    }
    if let Some(path) = &cli.junit_file {
        config.report.junit_file = path.clone();
    }
    config.discovery.include.extend(cli.include.iter().cloned());
    config.discovery.exclude.extend(cli.exclude.iter().cloned());
}

/// Discovers and runs everything under `paths`, returning the exit code.
async fn run(paths: &[PathBuf], config: &Config) -> Result<i32> {
    let jobs = config.subtest.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    let runners: Vec<Box<dyn Runner>> = vec![
        Box::new(DirectoryRunner::new()),
        Box::new(ScriptFileRunner::new(&config.discovery.script_pattern)?),
        Box::new(ScriptRunner::from_config(&config.discovery)),
    ];

    let name_filter = NameFilter::new(&config.discovery.include, &config.discovery.exclude)
        .context("Failed to build name filter")?;
    let mut filters: Vec<Box<dyn Filter>> = Vec::new();
    if !name_filter.is_empty() {
        filters.push(Box::new(name_filter));
    }

    let reporter = make_reporter(config);
    let handlers: Vec<Arc<dyn Handler>> = vec![
        Arc::new(TestCaseHandler::new(filters, runners)),
        Arc::new(ResultHandler::new(reporter.clone())),
    ];

    info!(
        jobs,
        output = %config.subtest.output,
        roots = paths.len(),
        "Starting test run"
    );
    let bus = Bus::new(SUBTEST_MESSAGES, handlers, jobs);

    for path in paths {
        debug!("Posting root {}", path.display());
        // Failures were already reported on the error channel.
        if let Err(e) = bus.found_test(&Test::path(path)).await {
            error!("Failed to process {}: {}", path.display(), e);
        }
    }
    bus.join().await;

    bus.report_totals().await?;
    bus.join().await;

    if tokio::time::timeout(CLOSE_TIMEOUT, bus.close()).await.is_err() {
        error!("Timed out waiting for workers to stop");
    }

    let summary = reporter.summary();
    debug!(?summary, "Run finished");
    Ok(summary.exit_code())
}

fn make_reporter(config: &Config) -> Arc<dyn Reporter> {
    match config.subtest.output {
        OutputFormat::Terse => Arc::new(TerseReporter::stdout()),
        OutputFormat::Verbose => Arc::new(VerboseReporter::stdout()),
        OutputFormat::Debug => Arc::new(DebugReporter::stdout()),
        OutputFormat::Junit => Arc::new(
            JUnitReporter::new(config.report.junit_file.clone())
                .with_testsuite_name(&config.report.testsuite_name),
        ),
    }
}
