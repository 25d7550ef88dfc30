//! Worker pool: competing consumers per worker group with bounded retries.

use crate::connectors::AdapterRegistry;
use crate::error::IKycError;
use crate::ledger::decision_hash;
use crate::orchestrator::{Orchestrator, StageOutput};
use crate::policy::{RiskEvaluator, RiskInputs};
use crate::queue::{Delivery, Requeue, StageTask, TaskQueue};
use crate::stage::{Stage, StagePolicy, WorkerGroup};
use crate::types::{StageScore, TicketId};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Maps a task to the adapter call for its stage.
pub struct StageExecutor {
    orchestrator: Orchestrator,
    adapters: AdapterRegistry,
    risk: Arc<dyn RiskEvaluator>,
}

impl StageExecutor {
    pub fn new(
        orchestrator: Orchestrator,
        adapters: AdapterRegistry,
        risk: Arc<dyn RiskEvaluator>,
    ) -> Self {
        Self {
            orchestrator,
            adapters,
            risk,
        }
    }

    /// Run one attempt. Maintenance stages do their work in place and return
    /// `None`; ticket stages return the output to record.
    pub async fn execute(&self, task: &StageTask) -> Result<Option<StageOutput>, IKycError> {
        let Some(ticket_id) = task.ticket_id else {
            self.run_maintenance(task.stage).await?;
            return Ok(None);
        };

        let output = match task.stage {
            Stage::Ocr | Stage::FaceMatch | Stage::Liveness => {
                self.score(ticket_id, task.stage).await?
            }
            Stage::Risk => self.assess_risk(ticket_id).await?,
            Stage::Anchor => self.anchor(ticket_id).await?,
            Stage::Notify => self.notify(ticket_id).await?,
            stage => {
                return Err(IKycError::Queue(format!(
                    "maintenance stage {stage} queued with a ticket id"
                )))
            }
        };
        Ok(Some(output))
    }

    async fn score(&self, ticket_id: TicketId, stage: Stage) -> Result<StageOutput, IKycError> {
        let ticket = self.orchestrator.get_status(ticket_id).await?;
        let adapter = self.adapters.scorer(stage)?;
        let score = adapter.score(&ticket.documents).await?;
        Ok(StageOutput::Score(score.into_stage_score()))
    }

    async fn assess_risk(&self, ticket_id: TicketId) -> Result<StageOutput, IKycError> {
        let ticket = self.orchestrator.get_status(ticket_id).await?;
        let sanctions = self.adapters.lookup_sanctions(&ticket.subject).await?;

        let ocr = ticket.score(Stage::Ocr);
        let inputs = RiskInputs {
            ocr_value: ocr.map(|s| s.value).unwrap_or(0.0),
            ocr_confidence: ocr.map(|s| s.confidence).unwrap_or(0.0),
            face_score: ticket.score_value(Stage::FaceMatch).unwrap_or(0.0),
            liveness_score: ticket.score_value(Stage::Liveness).unwrap_or(0.0),
            sanctions: sanctions.clone(),
        };
        let value = self.risk.evaluate(&inputs);
        Ok(StageOutput::Risk {
            score: StageScore::new(value, 1.0),
            sanctions,
        })
    }

    async fn anchor(&self, ticket_id: TicketId) -> Result<StageOutput, IKycError> {
        let ticket = self.orchestrator.get_status(ticket_id).await?;
        let digest = decision_hash(&ticket)?;
        let anchor = self
            .adapters
            .anchor()
            .ok_or_else(|| IKycError::Config("no ledger anchor configured".to_string()))?;
        let receipt = anchor.anchor(ticket_id, &digest).await?;
        Ok(StageOutput::Anchored(receipt))
    }

    async fn notify(&self, ticket_id: TicketId) -> Result<StageOutput, IKycError> {
        let ticket = self.orchestrator.get_status(ticket_id).await?;
        let notification = Orchestrator::notification_for(&ticket);
        match self.adapters.notifier() {
            Some(notifier) => notifier.notify(&notification).await?,
            None => tracing::debug!(ticket_id = %ticket_id, "No notifier configured"),
        }
        Ok(StageOutput::Notified)
    }

    async fn run_maintenance(&self, stage: Stage) -> Result<(), IKycError> {
        let now = Utc::now();
        match stage {
            Stage::RetentionPurge => {
                self.orchestrator.purge_expired(now).await?;
            }
            Stage::AuditRotation => {
                self.orchestrator.rotate_audit_log(now).await?;
            }
            Stage::StalledSweep => {
                self.orchestrator.sweep_stalled(now).await?;
            }
            stage => {
                return Err(IKycError::Queue(format!(
                    "stage {stage} queued without a ticket id"
                )))
            }
        }
        Ok(())
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    /// The ticket was already closed; the task was acked without running.
    Skipped,
    Retrying { next_attempt: u32, delay: Duration },
    DeadLettered { reason: String },
    /// The lease expired before settlement; the queue redelivers.
    LeaseLost,
}

pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    orchestrator: Orchestrator,
    executor: StageExecutor,
    policies: BTreeMap<Stage, StagePolicy>,
    concurrency: BTreeMap<WorkerGroup, usize>,
}

impl WorkerPool {
    pub fn new(
        orchestrator: Orchestrator,
        adapters: AdapterRegistry,
        risk: Arc<dyn RiskEvaluator>,
    ) -> Self {
        Self {
            queue: orchestrator.queue(),
            executor: StageExecutor::new(orchestrator.clone(), adapters, risk),
            orchestrator,
            policies: BTreeMap::new(),
            concurrency: WorkerGroup::ALL.into_iter().map(|g| (g, 1)).collect(),
        }
    }

    pub fn with_policy(mut self, stage: Stage, policy: StagePolicy) -> Self {
        self.policies.insert(stage, policy);
        self
    }

    pub fn with_policies(mut self, policies: impl IntoIterator<Item = (Stage, StagePolicy)>) -> Self {
        self.policies.extend(policies);
        self
    }

    pub fn with_concurrency(mut self, group: WorkerGroup, workers: usize) -> Self {
        self.concurrency.insert(group, workers.max(1));
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn policy(&self, stage: Stage) -> StagePolicy {
        self.policies
            .get(&stage)
            .copied()
            .unwrap_or_else(|| StagePolicy::default_for(stage))
    }

    pub fn concurrency(&self, group: WorkerGroup) -> usize {
        self.concurrency.get(&group).copied().unwrap_or(1)
    }

    /// Start `concurrency(group)` consumers for every group. Each exits once
    /// `shutdown` flips to `true`, after settling its current task.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for group in WorkerGroup::ALL {
            for worker in 0..self.concurrency(group) {
                let pool = self.clone();
                let mut shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    tracing::debug!(group = %group, worker, "Worker started");
                    loop {
                        match pool.queue.dequeue(group, &mut shutdown).await {
                            Ok(Some(delivery)) => {
                                if let Err(e) = pool.process(delivery).await {
                                    tracing::error!(group = %group, error = %e, "Task processing failed");
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(group = %group, error = %e, "Dequeue failed");
                                tokio::time::sleep(Duration::from_millis(250)).await;
                            }
                        }
                    }
                    tracing::debug!(group = %group, worker, "Worker stopped");
                }));
            }
        }
        tracing::info!(workers = handles.len(), "Worker pool started");
        handles
    }

    /// Take and process one ready task of `group`, if any.
    pub async fn process_next(&self, group: WorkerGroup) -> Result<Option<TaskOutcome>, IKycError> {
        match self.queue.try_dequeue(group).await? {
            Some(delivery) => self.process(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process until every group is empty, sleeping through backoff delays.
    /// Returns the number of deliveries handled.
    pub async fn drain(&self) -> Result<usize, IKycError> {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for group in WorkerGroup::ALL {
                while self.process_next(group).await?.is_some() {
                    handled += 1;
                    progressed = true;
                }
            }
            if progressed {
                continue;
            }

            let mut next_due: Option<Duration> = None;
            for group in WorkerGroup::ALL {
                if let Some(due) = self.queue.next_due(group).await? {
                    next_due = Some(next_due.map_or(due, |current| current.min(due)));
                }
            }
            match next_due {
                Some(due) => tokio::time::sleep(due.max(Duration::from_millis(1))).await,
                None => return Ok(handled),
            }
        }
    }

    pub async fn process(&self, delivery: Delivery) -> Result<TaskOutcome, IKycError> {
        let task = delivery.task.clone();

        match self.orchestrator.on_stage_started(&task).await {
            Ok(true) => {}
            Ok(false) => {
                self.queue.ack(&delivery).await?;
                return Ok(TaskOutcome::Skipped);
            }
            Err(e) => return self.fail(&delivery, e).await,
        }

        let policy = self.policy(task.stage);
        let attempt = match tokio::time::timeout(policy.timeout(), self.executor.execute(&task)).await
        {
            Ok(result) => result,
            Err(_) => Err(IKycError::AdapterTimeout {
                stage: task.stage,
                timeout_ms: policy.timeout_ms,
            }),
        };

        let completed = match attempt {
            Ok(Some(output)) => match task.ticket_id {
                Some(ticket_id) => {
                    self.orchestrator
                        .on_stage_completed(ticket_id, task.stage, output)
                        .await
                }
                None => Ok(()),
            },
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = completed {
            return self.fail(&delivery, e).await;
        }

        if self.queue.ack(&delivery).await? {
            tracing::debug!(task_id = %task.task_id, stage = %task.stage, "Task completed");
            Ok(TaskOutcome::Completed)
        } else {
            tracing::warn!(task_id = %task.task_id, stage = %task.stage, "Lease lost before ack");
            Ok(TaskOutcome::LeaseLost)
        }
    }

    async fn fail(&self, delivery: &Delivery, error: IKycError) -> Result<TaskOutcome, IKycError> {
        let task = &delivery.task;
        let policy = self.policy(task.stage);

        if error.is_retryable() && policy.retries_left(task.attempt) {
            let delay = policy.backoff.delay(task.attempt, rand::random::<f64>());
            let next = task.next_attempt(error.to_string());
            let next_attempt = next.attempt;
            if !self
                .queue
                .nack(delivery, Requeue::After { task: next, delay })
                .await?
            {
                return Ok(TaskOutcome::LeaseLost);
            }
            tracing::warn!(
                ticket_id = ?task.ticket_id,
                stage = %task.stage,
                attempt = task.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Stage attempt failed, retrying"
            );
            return Ok(TaskOutcome::Retrying {
                next_attempt,
                delay,
            });
        }

        let terminal = if error.is_retryable() {
            IKycError::RetryExhausted {
                stage: task.stage,
                attempts: task.attempt,
                last_error: error.to_string(),
            }
        } else {
            error
        };
        let reason = terminal.to_string();
        if !self.queue.dead_letter(delivery, reason.clone()).await? {
            return Ok(TaskOutcome::LeaseLost);
        }
        tracing::error!(
            ticket_id = ?task.ticket_id,
            stage = %task.stage,
            attempt = task.attempt,
            error = %terminal,
            "Task dead-lettered"
        );
        self.orchestrator
            .on_stage_failed_permanently(task, &terminal)
            .await?;
        Ok(TaskOutcome::DeadLettered { reason })
    }
}
