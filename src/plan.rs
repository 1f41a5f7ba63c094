//! Provisioning plans.
//!
//! A plan is a TOML document with one `[[task]]` table per task:
//!
//! ```toml
//! name = "workstation"
//!
//! [[task]]
//! id = "git"
//! executor = "shell"
//! action = "install"
//! params = { command = "apt-get install -y git" }
//!
//! [[task.verification]]
//! name = "git-version"
//! probe = "git --version"
//! expect = { kind = "contains", value = "git version" }
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{DependencyGraph, ExecutorKind, Task};
use crate::Result;

/// A named list of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "task", default)]
    pub tasks: Vec<Task>,
}

impl Plan {
    /// Parse a plan, giving tasks without `timeout_ms` the supplied default.
    pub fn parse(text: &str, default_timeout: Duration) -> Result<Self> {
        let mut doc: toml::Table = toml::from_str(text)?;
        if let Some(toml::Value::Array(tasks)) = doc.get_mut("task") {
            let millis = i64::try_from(default_timeout.as_millis()).unwrap_or(i64::MAX);
            for task in tasks.iter_mut() {
                if let toml::Value::Table(table) = task {
                    table
                        .entry("timeout_ms")
                        .or_insert(toml::Value::Integer(millis));
                }
            }
        }
        let plan: Plan = toml::Value::Table(doc).try_into()?;
        tracing::debug!(name = %plan.name, tasks = plan.tasks.len(), "plan parsed");
        Ok(plan)
    }

    /// Read and parse a plan file.
    pub async fn load(path: &Path, default_timeout: Duration) -> Result<Self> {
        tracing::debug!("Plan::load path={}", path.display());
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text, default_timeout)
    }

    /// Build the dependency graph, surfacing duplicate ids, unknown
    /// prerequisites and cycles.
    pub fn graph(&self) -> Result<DependencyGraph> {
        DependencyGraph::build(self.tasks.iter().cloned())
    }

    /// Executor kinds the plan needs.
    pub fn executors(&self) -> BTreeSet<ExecutorKind> {
        self.tasks.iter().map(|t| t.executor()).collect()
    }
}
