//! Directory discovery.

use anyhow::Context;
use async_trait::async_trait;

use super::{Runner, Test, TestKind};
use crate::bus::Bus;
use crate::orchestrator::SubtestBus;

/// Expands a directory into one `found_test` per entry.
///
/// Entries are posted in name order with absolute paths.
#[derive(Debug, Default)]
pub struct DirectoryRunner;

impl DirectoryRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for DirectoryRunner {
    fn name(&self) -> &str {
        "directory"
    }

    fn kinds(&self) -> &[TestKind] {
        &[TestKind::Path]
    }

    fn refine(&self, test: &Test) -> bool {
        test.location().is_dir()
    }

    async fn run(&self, bus: &Bus, test: &Test) -> anyhow::Result<()> {
        let base = std::path::absolute(test.location())
            .with_context(|| format!("Failed to resolve {}", test.location().display()))?;

        let mut entries = tokio::fs::read_dir(&base)
            .await
            .with_context(|| format!("Failed to list {}", base.display()))?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry.file_name());
        }
        children.sort();

        tracing::debug!(dir = %base.display(), count = children.len(), "Expanding directory");
        for child in children {
            bus.found_test(&Test::path(base.join(child))).await?;
        }
        Ok(())
    }
}
