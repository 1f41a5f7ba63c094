//! Capability lookup from executor kind to executor endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::ExecutorKind;
use crate::dispatch::executor::Executor;
use crate::{Error, Result};

/// Registered executors, one per kind.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: BTreeMap<ExecutorKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own kind.
    ///
    /// # Errors
    /// `ExecutorExists` if the kind is already served.
    pub fn register(&mut self, executor: Arc<dyn Executor>) -> Result<()> {
        let kind = executor.kind();
        if self.executors.contains_key(&kind) {
            return Err(Error::ExecutorExists(kind.to_string()));
        }
        tracing::debug!(kind = %kind, "registered executor");
        self.executors.insert(kind, executor);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, executor: Arc<dyn Executor>) -> Result<Self> {
        self.register(executor)?;
        Ok(self)
    }

    /// Look up the executor for a kind.
    pub fn get(&self, kind: ExecutorKind) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NoExecutor(kind.to_string()))
    }

    pub fn contains(&self, kind: ExecutorKind) -> bool {
        self.executors.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ExecutorKind> {
        self.executors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
