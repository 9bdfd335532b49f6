//! Name-based test selection.

use anyhow::Context;
use regex::Regex;

use super::{Filter, Test, TestKind};

/// Admits tests whose standard form matches any include pattern (or all
/// tests when there are none) and no exclude pattern.
///
/// Path tests are always admitted so discovery can keep descending.
///
/// # Example
///
/// ```
/// use subtest::framework::{Filter, NameFilter, Test};
///
/// let filter = NameFilter::new(&["math".to_string()], &["slow".to_string()])?;
/// assert!(filter.admit(&Test::script("test_math.sh")));
/// assert!(!filter.admit(&Test::script("test_math_slow.sh")));
/// assert!(!filter.admit(&Test::script("test_io.sh")));
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct NameFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NameFilter {
    pub fn new(include: &[String], exclude: &[String]) -> anyhow::Result<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Returns `true` if the filter admits everything.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

fn compile(patterns: &[String]) -> anyhow::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("Invalid filter pattern: {}", p)))
        .collect()
}

impl Filter for NameFilter {
    fn admit(&self, test: &Test) -> bool {
        if test.kind() == TestKind::Path {
            return true;
        }
        let name = test.standard_form();
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(&name));
        included && !self.exclude.iter().any(|re| re.is_match(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_admits_everything() {
        let filter = NameFilter::default();
        assert!(filter.is_empty());
        assert!(filter.admit(&Test::script("anything.sh")));
    }

    #[test]
    fn test_paths_always_admitted() {
        let filter = NameFilter::new(&["nomatch".to_string()], &[".*".to_string()]).unwrap();
        assert!(filter.admit(&Test::path("/some/dir")));
        assert!(!filter.admit(&Test::script("/some/dir/test_a.sh")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(NameFilter::new(&["(".to_string()], &[]).is_err());
    }
}
