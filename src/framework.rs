//! Test records, result kinds, and the runner and filter contracts.
//!
//! A [`Test`] is an immutable, tagged work item. Discovery runners turn one
//! test into more tests (a directory into its children, a script file into a
//! runnable script); execution runners turn a test into terminal results.
//!
//! ```text
//!   Path(dir) ──DirectoryRunner──► Path(child) ...
//!   Path(test_x.sh) ──ScriptFileRunner──► Script(test_x.sh)
//!   Script(test_x.sh) ──ScriptRunner──► report_result(success|fail|...)
//! ```
//!
//! # Built-in Runners
//!
//! | Runner | Claims | Posts |
//! |--------|--------|-------|
//! | [`path::DirectoryRunner`] | `Path` directories | `found_test` per child |
//! | [`script::ScriptFileRunner`] | `Path` files matching a glob | `found_test(Script)` |
//! | [`script::ScriptRunner`] | `Script` | one result per run or TAP case |

pub mod filter;
pub mod path;
pub mod script;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::Bus;

pub use filter::NameFilter;
pub use path::DirectoryRunner;
pub use script::{ScriptFileRunner, ScriptRunner};

/// Variant tag of a [`Test`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Path,
    Script,
}

impl TestKind {
    /// Type name used when rendering a test.
    pub fn type_name(self) -> &'static str {
        match self {
            TestKind::Path => "PathTest",
            TestKind::Script => "ScriptTest",
        }
    }
}

/// A filesystem location still to be explored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTest {
    pub path: PathBuf,
}

/// A runnable script, optionally narrowed to one TAP case for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTest {
    pub path: PathBuf,

    /// TAP case number. Only set on reporting copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<u32>,
}

/// A discovered or runnable unit of work.
///
/// # Example
///
/// ```
/// use subtest::framework::{Test, TestKind};
///
/// let test = Test::script("suite/test_math.sh");
/// assert_eq!(test.kind(), TestKind::Script);
/// assert_eq!(test.to_string(), r#"ScriptTest("suite/test_math.sh", None)"#);
///
/// let case = test.with_case(2);
/// assert_eq!(case.standard_form(), "suite/test_math.sh(2)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Test {
    Path(PathTest),
    Script(ScriptTest),
}

impl Test {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Test::Path(PathTest { path: path.into() })
    }

    pub fn script(path: impl Into<PathBuf>) -> Self {
        Test::Script(ScriptTest {
            path: path.into(),
            case: None,
        })
    }

    pub fn kind(&self) -> TestKind {
        match self {
            Test::Path(_) => TestKind::Path,
            Test::Script(_) => TestKind::Script,
        }
    }

    /// Filesystem location the test refers to.
    pub fn location(&self) -> &Path {
        match self {
            Test::Path(t) => &t.path,
            Test::Script(t) => &t.path,
        }
    }

    /// Rendered field values, in declaration order.
    pub fn fields(&self) -> Vec<String> {
        match self {
            Test::Path(t) => vec![format!("{:?}", t.path.display().to_string())],
            Test::Script(t) => vec![
                format!("{:?}", t.path.display().to_string()),
                format!("{:?}", t.case),
            ],
        }
    }

    /// Short name used in result output.
    pub fn standard_form(&self) -> String {
        match self {
            Test::Path(t) => t.path.display().to_string(),
            Test::Script(ScriptTest { path, case: None }) => path.display().to_string(),
            Test::Script(ScriptTest {
                path,
                case: Some(case),
            }) => format!("{}({})", path.display(), case),
        }
    }

    /// Returns a copy narrowed to one case. Path tests have no cases and are
    /// returned unchanged.
    pub fn with_case(&self, case: u32) -> Self {
        match self {
            Test::Script(t) => Test::Script(ScriptTest {
                path: t.path.clone(),
                case: Some(case),
            }),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_record(self.kind().type_name(), &self.fields()))
    }
}

/// Renders `Name(field, field, ...)`.
pub fn render_record(type_name: &str, fields: &[String]) -> String {
    format!("{}({})", type_name, fields.join(", "))
}

/// Terminal outcome of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Success,
    Fail,
    Error,
    ExpectedFail,
    Skip,
    Unhandled,
}

impl ResultKind {
    pub const ALL: [ResultKind; 6] = [
        ResultKind::Success,
        ResultKind::Fail,
        ResultKind::Error,
        ResultKind::ExpectedFail,
        ResultKind::Skip,
        ResultKind::Unhandled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::Success => "success",
            ResultKind::Fail => "fail",
            ResultKind::Error => "error",
            ResultKind::ExpectedFail => "expectedfail",
            ResultKind::Skip => "skip",
            ResultKind::Unhandled => "unhandled",
        }
    }

    /// Whether this outcome makes the run fail.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ResultKind::Fail | ResultKind::Error | ResultKind::Unhandled
        )
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pluggable unit that claims and executes tests of some kinds.
///
/// Runners may post any number of `found_test` messages and, for tests they
/// fully execute, must eventually post a terminal `report_result`.
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &str;

    /// Test kinds this runner may claim.
    fn kinds(&self) -> &[TestKind];

    /// Further narrows which tests of a supported kind are claimed.
    fn refine(&self, _test: &Test) -> bool {
        true
    }

    fn handles(&self, test: &Test) -> bool {
        self.kinds().contains(&test.kind()) && self.refine(test)
    }

    async fn run(&self, bus: &Bus, test: &Test) -> anyhow::Result<()>;
}

/// Predicate deciding whether a discovered test proceeds or is skipped.
pub trait Filter: Send + Sync {
    fn admit(&self, test: &Test) -> bool;
}

impl<F> Filter for F
where
    F: Fn(&Test) -> bool + Send + Sync,
{
    fn admit(&self, test: &Test) -> bool {
        self(test)
    }
}
