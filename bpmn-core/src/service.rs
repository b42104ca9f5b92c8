//! ServiceTaskRegistry: the directory of named task implementations a
//! serviceTask's `task_type` resolves against. The registry is seeded at
//! boot by the embedding application — this crate has no plugin-discovery
//! mechanics (spec Non-goals).

use crate::error::{EngineError, Result};
use crate::types::Variable;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a running service task needs: the task's static `properties`
/// (from the BPMN extension elements) plus the live process variable scope.
pub struct ServiceTaskContext<'a> {
    pub node_id: &'a str,
    pub properties: &'a BTreeMap<String, String>,
    pub variables: &'a BTreeMap<String, Variable>,
}

/// One named, executable service task implementation.
#[async_trait]
pub trait ServiceTask: Send + Sync {
    async fn execute(&self, ctx: ServiceTaskContext<'_>) -> Result<BTreeMap<String, Variable>>;
}

/// The directory of task types known to this engine instance.
#[derive(Default, Clone)]
pub struct ServiceTaskRegistry {
    tasks: std::collections::BTreeMap<String, Arc<dyn ServiceTask>>,
}

impl ServiceTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, task: Arc<dyn ServiceTask>) {
        self.tasks.insert(task_type.into(), task);
    }

    pub async fn execute(
        &self,
        task_type: &str,
        ctx: ServiceTaskContext<'_>,
    ) -> Result<BTreeMap<String, Variable>> {
        let task = self.tasks.get(task_type).ok_or_else(|| EngineError::ServiceTaskFailed {
            task_type: task_type.to_string(),
            message: "no implementation registered for this task type".to_string(),
            error_code: None,
        })?;
        task.execute(ctx).await
    }
}
