//! Task registry
//!
//! Maps each [`TaskKind`] to its implementation. Intercept hooks can force a
//! tagged task to fail or be skipped, which is how tests and diagnostics
//! exercise pipeline behaviour without touching the tables.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::{buyer, common, maker, multisig, seller, taker, Task, TaskKind};

/// Forced behaviour for a tagged task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercept {
    Fail { reason: String },
    Skip,
}

/// Result of looking up a tag
pub enum Resolved {
    Run(Arc<dyn Task>),
    Skip,
    Fail(String),
    Missing,
}

pub struct TaskRegistry {
    tasks: HashMap<TaskKind, Arc<dyn Task>>,
    intercepts: RwLock<HashMap<TaskKind, Intercept>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl TaskRegistry {
    /// Registry without any task
    pub fn empty() -> Self {
        Self {
            tasks: HashMap::new(),
            intercepts: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with every protocol task
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        common::register(&mut registry);
        taker::register(&mut registry);
        maker::register(&mut registry);
        buyer::register(&mut registry);
        seller::register(&mut registry);
        multisig::register(&mut registry);
        registry
    }

    /// Register an implementation under its own tag, replacing any previous one
    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks.insert(task.kind(), task);
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.tasks.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn set_intercept(&self, kind: TaskKind, intercept: Intercept) {
        debug!(task = %kind, intercept = ?intercept, "Installing task intercept");
        self.intercepts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, intercept);
    }

    pub fn clear_intercept(&self, kind: TaskKind) {
        self.intercepts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind);
    }

    pub fn clear_intercepts(&self) {
        self.intercepts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn resolve(&self, kind: TaskKind) -> Resolved {
        let intercept = self
            .intercepts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned();
        match intercept {
            Some(Intercept::Skip) => Resolved::Skip,
            Some(Intercept::Fail { reason }) => Resolved::Fail(reason),
            None => match self.tasks.get(&kind) {
                Some(task) => Resolved::Run(task.clone()),
                None => Resolved::Missing,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;
    use escrow_core::trade::TradeRole;

    #[test]
    fn test_standard_registry_covers_every_table() {
        let registry = TaskRegistry::standard();
        for role in TradeRole::ALL {
            for transition in Protocol::for_role(role).transitions() {
                for kind in transition.tasks {
                    assert!(
                        registry.contains(*kind),
                        "{} used by {} is not registered",
                        kind,
                        transition.name
                    );
                }
            }
        }
    }

    #[test]
    fn test_intercepts_override_lookup() {
        let registry = TaskRegistry::standard();
        registry.set_intercept(
            TaskKind::ApplyFilter,
            Intercept::Fail {
                reason: "forced".into(),
            },
        );
        assert!(matches!(registry.resolve(TaskKind::ApplyFilter), Resolved::Fail(r) if r == "forced"));

        registry.set_intercept(TaskKind::ApplyFilter, Intercept::Skip);
        assert!(matches!(registry.resolve(TaskKind::ApplyFilter), Resolved::Skip));

        registry.clear_intercept(TaskKind::ApplyFilter);
        assert!(matches!(registry.resolve(TaskKind::ApplyFilter), Resolved::Run(_)));
        assert!(matches!(TaskRegistry::empty().resolve(TaskKind::ApplyFilter), Resolved::Missing));
    }
}
