//! SagaOrchestrator / TransactionManager: sequential and parallel saga step
//! execution with reverse-order compensation on failure. Parallel groups
//! run concurrently via `futures::join_all`.

use crate::error::Result;
use crate::events::{EventBus, RuntimeEvent};
use crate::state::StateManager;
use crate::types::{InstanceId, Saga, SagaResult, SagaStatus, SagaStep};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

/// The side of a saga step that actually does something — typically backed
/// by the [`ServiceTaskRegistry`](crate::service::ServiceTaskRegistry).
#[async_trait]
pub trait SagaStepRunner: Send + Sync {
    async fn run_action(&self, action_id: &str, data: &serde_json::Value) -> Result<()>;
    async fn run_compensation(&self, compensation_id: &str, data: &serde_json::Value) -> Result<()>;
}

pub struct SagaOrchestrator {
    store: Arc<dyn StateManager>,
    events: Arc<EventBus>,
}

impl SagaOrchestrator {
    pub fn new(store: Arc<dyn StateManager>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub fn new_saga(&self, saga_id: impl Into<String>, instance_id: InstanceId) -> Saga {
        Saga::new(saga_id, instance_id)
    }

    /// Execute every sequential step in order, then every parallel group
    /// concurrently within itself. The first failure anywhere triggers
    /// reverse-order compensation of everything completed so far and ends
    /// the saga in `SagaStatus::Compensated`.
    pub async fn execute(&self, saga: &mut Saga, runner: &dyn SagaStepRunner) -> Result<SagaResult> {
        for i in 0..saga.steps.len() {
            let (action_id, data) = (saga.steps[i].action_id.clone(), saga.steps[i].data.clone());
            match runner.run_action(&action_id, &data).await {
                Ok(()) => {
                    saga.steps[i].completed = true;
                    self.events.publish(
                        "process.saga_step_completed",
                        RuntimeEvent::SagaStepCompleted {
                            saga_id: saga.saga_id.clone(),
                            action_id,
                        },
                    );
                }
                Err(err) => {
                    return self.fail_and_compensate(saga, runner, &action_id, err.to_string()).await;
                }
            }
        }

        for g in 0..saga.parallel_groups.len() {
            let group_steps = saga.parallel_groups[g].steps.clone();
            let results = join_all(
                group_steps
                    .iter()
                    .map(|step| runner.run_action(&step.action_id, &step.data)),
            )
            .await;

            let mut group_failed = None;
            for (step, result) in saga.parallel_groups[g].steps.iter_mut().zip(results) {
                match result {
                    Ok(()) => {
                        step.completed = true;
                        saga.steps.push(step.clone());
                    }
                    Err(err) => group_failed = Some((step.action_id.clone(), err.to_string())),
                }
            }
            if let Some((action_id, reason)) = group_failed {
                return self.fail_and_compensate(saga, runner, &action_id, reason).await;
            }
        }

        saga.status = SagaStatus::Completed;
        self.store.save_saga(saga).await?;
        self.events.publish(
            "process.saga_completed",
            RuntimeEvent::SagaCompleted {
                saga_id: saga.saga_id.clone(),
            },
        );
        Ok(SagaResult {
            status: SagaStatus::Completed,
            data: None,
        })
    }

    async fn fail_and_compensate(
        &self,
        saga: &mut Saga,
        runner: &dyn SagaStepRunner,
        failed_action_id: &str,
        reason: String,
    ) -> Result<SagaResult> {
        saga.status = SagaStatus::Compensating;
        self.events.publish(
            "process.saga_compensating",
            RuntimeEvent::SagaCompensating {
                saga_id: saga.saga_id.clone(),
                failed_step: failed_action_id.to_string(),
            },
        );

        for step in completed_in_reverse(saga) {
            runner.run_compensation(&step.compensation_id, &step.data).await?;
        }
        for step in saga.steps.iter_mut() {
            if step.completed {
                step.compensated = true;
            }
        }

        saga.status = SagaStatus::Compensated;
        self.store.save_saga(saga).await?;
        Ok(SagaResult {
            status: SagaStatus::Compensated,
            data: Some(serde_json::json!({ "error": reason })),
        })
    }
}

fn completed_in_reverse(saga: &Saga) -> Vec<SagaStep> {
    let mut steps: Vec<SagaStep> = saga.steps.iter().filter(|s| s.completed && !s.compensated).cloned().collect();
    steps.reverse();
    steps
}
