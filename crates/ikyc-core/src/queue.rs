//! Stage task queue with priorities, delayed redelivery, leases and dead letters.

use crate::error::IKycError;
use crate::stage::{Stage, WorkerGroup};
use crate::types::TicketId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

/// Upper bound on how long an idle worker sleeps before re-checking delayed
/// tasks and expired leases.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Ephemeral unit of work. Owned by the queue until acked or dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTask {
    pub task_id: Uuid,
    /// Absent for batch maintenance work.
    pub ticket_id: Option<TicketId>,
    pub stage: Stage,
    /// 1-based attempt number of the next execution.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl StageTask {
    pub fn new(ticket_id: TicketId, stage: Stage) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            ticket_id: Some(ticket_id),
            stage,
            attempt: 1,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn maintenance(stage: Stage) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            ticket_id: None,
            stage,
            attempt: 1,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn group(&self) -> WorkerGroup {
        self.stage.group()
    }

    /// The same task, scheduled for its next attempt.
    pub fn next_attempt(&self, error: impl Into<String>) -> Self {
        Self {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            last_error: Some(error.into()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// A leased task. Must be acked, nacked or dead-lettered before the lease
/// expires, otherwise the task is delivered again.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub lease_id: u64,
    pub task: StageTask,
    pub priority: Priority,
    pub leased_until: Instant,
}

/// What `nack` does with the task.
#[derive(Debug, Clone, PartialEq)]
pub enum Requeue {
    /// Put the given task (usually the next attempt) back after `delay`.
    After { task: StageTask, delay: Duration },
    /// Drop the task.
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: StageTask,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }
}

/// Queue/broker seam. Producers append; worker groups consume competitively.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: StageTask, priority: Priority) -> Result<(), IKycError>;

    /// Suspend until a task for `group` is available or `shutdown` flips to
    /// `true`, in which case `None` is returned.
    async fn dequeue(
        &self,
        group: WorkerGroup,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Delivery>, IKycError>;

    async fn try_dequeue(&self, group: WorkerGroup) -> Result<Option<Delivery>, IKycError>;

    /// Returns `false` if the lease had already expired.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, IKycError>;

    async fn nack(&self, delivery: &Delivery, requeue: Requeue) -> Result<bool, IKycError>;

    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Result<bool, IKycError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, IKycError>;

    /// Remove and return up to `limit` dead letters, oldest first.
    async fn take_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, IKycError>;

    async fn depth(&self, group: WorkerGroup) -> Result<QueueDepth, IKycError>;

    /// Time until the earliest delayed task of `group` becomes ready.
    async fn next_due(&self, group: WorkerGroup) -> Result<Option<Duration>, IKycError>;
}

#[derive(Debug, Clone)]
struct Ready {
    seq: u64,
    priority: Priority,
    task: StageTask,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    // Max-heap: higher priority first, then FIFO.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct GroupState {
    ready: BinaryHeap<Ready>,
    delayed: Vec<(Instant, Ready)>,
}

impl GroupState {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, ready) = self.delayed.swap_remove(index);
                self.ready.push(ready);
            } else {
                index += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    groups: HashMap<WorkerGroup, GroupState>,
    in_flight: HashMap<u64, Delivery>,
    dead: VecDeque<DeadLetter>,
    next_seq: u64,
}

impl QueueState {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn group(&mut self, group: WorkerGroup) -> &mut GroupState {
        self.groups.entry(group).or_default()
    }

    /// Expired leases go back to the ready heap with the same attempt number.
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired = self
            .in_flight
            .iter()
            .filter(|(_, delivery)| delivery.leased_until <= now)
            .map(|(lease, _)| *lease)
            .collect::<Vec<_>>();
        for lease in &expired {
            if let Some(delivery) = self.in_flight.remove(lease) {
                tracing::warn!(
                    task_id = %delivery.task.task_id,
                    stage = %delivery.task.stage,
                    attempt = delivery.task.attempt,
                    "Lease expired, redelivering task"
                );
                let seq = self.seq();
                self.group(delivery.task.group()).ready.push(Ready {
                    seq,
                    priority: delivery.priority,
                    task: delivery.task,
                });
            }
        }
        expired.len()
    }
}

/// Dead letters kept before the oldest are evicted.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 10_000;

/// In-process queue for development, tests and single-node deployments.
#[derive(Debug, Clone)]
pub struct InMemoryTaskQueue {
    state: Arc<Mutex<QueueState>>,
    signals: Arc<HashMap<WorkerGroup, Notify>>,
    visibility_timeout: Duration,
    dead_letter_capacity: usize,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl InMemoryTaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        let signals = WorkerGroup::ALL
            .into_iter()
            .map(|group| (group, Notify::new()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            signals: Arc::new(signals),
            visibility_timeout,
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }

    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity.max(1);
        self
    }

    fn wake(&self, group: WorkerGroup) {
        if let Some(signal) = self.signals.get(&group) {
            signal.notify_one();
        }
    }

    async fn push(&self, task: StageTask, priority: Priority, delay: Duration) {
        let group = task.group();
        {
            let mut state = self.state.lock().await;
            let seq = state.seq();
            let ready = Ready {
                seq,
                priority,
                task,
            };
            if delay.is_zero() {
                state.group(group).ready.push(ready);
            } else {
                state
                    .group(group)
                    .delayed
                    .push((Instant::now() + delay, ready));
            }
        }
        self.wake(group);
    }

    async fn settle(&self, delivery: &Delivery) -> Option<Delivery> {
        self.state.lock().await.in_flight.remove(&delivery.lease_id)
    }

    /// Earliest instant at which `group` could have work again.
    async fn next_wake(&self, group: WorkerGroup) -> Option<Instant> {
        let state = self.state.lock().await;
        let delayed = state
            .groups
            .get(&group)
            .and_then(|g| g.delayed.iter().map(|(due, _)| *due).min());
        let lease = state
            .in_flight
            .values()
            .filter(|d| d.task.group() == group)
            .map(|d| d.leased_until)
            .min();
        match (delayed, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: StageTask, priority: Priority) -> Result<(), IKycError> {
        tracing::debug!(
            task_id = %task.task_id,
            stage = %task.stage,
            attempt = task.attempt,
            "Task enqueued"
        );
        self.push(task, priority, Duration::ZERO).await;
        Ok(())
    }

    async fn dequeue(
        &self,
        group: WorkerGroup,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Delivery>, IKycError> {
        let signal = self
            .signals
            .get(&group)
            .ok_or_else(|| IKycError::Queue(format!("unknown worker group {group}")))?;

        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            if let Some(delivery) = self.try_dequeue(group).await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            let wake_at = self
                .next_wake(group)
                .await
                .map(|at| at.min(now + IDLE_POLL))
                .unwrap_or(now + IDLE_POLL);

            tokio::select! {
                _ = signal.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn try_dequeue(&self, group: WorkerGroup) -> Result<Option<Delivery>, IKycError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);
        let group_state = state.group(group);
        group_state.promote_due(now);
        let Some(ready) = group_state.ready.pop() else {
            return Ok(None);
        };

        let lease_id = state.seq();
        let delivery = Delivery {
            lease_id,
            task: ready.task,
            priority: ready.priority,
            leased_until: now + self.visibility_timeout,
        };
        state.in_flight.insert(lease_id, delivery.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, IKycError> {
        Ok(self.settle(delivery).await.is_some())
    }

    async fn nack(&self, delivery: &Delivery, requeue: Requeue) -> Result<bool, IKycError> {
        if self.settle(delivery).await.is_none() {
            return Ok(false);
        }
        if let Requeue::After { task, delay } = requeue {
            self.push(task, delivery.priority, delay).await;
        }
        Ok(true)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Result<bool, IKycError> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&delivery.lease_id).is_none() {
            return Ok(false);
        }
        while state.dead.len() >= self.dead_letter_capacity {
            if let Some(evicted) = state.dead.pop_front() {
                tracing::warn!(
                    task_id = %evicted.task.task_id,
                    stage = %evicted.task.stage,
                    "Dead-letter capacity reached, evicting oldest"
                );
            }
        }
        state.dead.push_back(DeadLetter {
            task: delivery.task.clone(),
            reason,
            dead_lettered_at: Utc::now(),
        });
        Ok(true)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, IKycError> {
        Ok(self.state.lock().await.dead.iter().cloned().collect())
    }

    async fn take_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, IKycError> {
        let mut state = self.state.lock().await;
        let count = limit.min(state.dead.len());
        Ok(state.dead.drain(..count).collect())
    }

    async fn depth(&self, group: WorkerGroup) -> Result<QueueDepth, IKycError> {
        let state = self.state.lock().await;
        let (ready, delayed) = state
            .groups
            .get(&group)
            .map(|g| (g.ready.len(), g.delayed.len()))
            .unwrap_or((0, 0));
        let in_flight = state
            .in_flight
            .values()
            .filter(|d| d.task.group() == group)
            .count();
        Ok(QueueDepth {
            ready,
            delayed,
            in_flight,
        })
    }

    async fn next_due(&self, group: WorkerGroup) -> Result<Option<Duration>, IKycError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .groups
            .get(&group)
            .and_then(|g| g.delayed.iter().map(|(due, _)| *due).min())
            .map(|due| due.saturating_duration_since(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(stage: Stage) -> StageTask {
        StageTask::new(TicketId::new(), stage)
    }

    #[tokio::test]
    async fn groups_are_isolated() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(task(Stage::Anchor), Priority::Normal).await.unwrap();

        assert!(queue
            .try_dequeue(WorkerGroup::Notification)
            .await
            .unwrap()
            .is_none());
        let delivery = queue
            .try_dequeue(WorkerGroup::Blockchain)
            .await
            .unwrap()
            .expect("anchor task");
        assert_eq!(delivery.task.stage, Stage::Anchor);
    }

    #[tokio::test]
    async fn higher_priority_first_then_fifo() {
        let queue = InMemoryTaskQueue::default();
        let first = task(Stage::Ocr);
        let second = task(Stage::Ocr);
        let urgent = task(Stage::Ocr);
        queue.enqueue(first.clone(), Priority::Normal).await.unwrap();
        queue.enqueue(second.clone(), Priority::Normal).await.unwrap();
        queue.enqueue(urgent.clone(), Priority::High).await.unwrap();

        let mut order = Vec::new();
        while let Some(delivery) = queue.try_dequeue(WorkerGroup::Ocr).await.unwrap() {
            order.push(delivery.task.task_id);
            queue.ack(&delivery).await.unwrap();
        }
        assert_eq!(order, vec![urgent.task_id, first.task_id, second.task_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_with_delay_holds_task_back() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(task(Stage::Risk), Priority::Normal).await.unwrap();
        let delivery = queue.try_dequeue(WorkerGroup::Risk).await.unwrap().unwrap();

        let retry = delivery.task.next_attempt("boom");
        queue
            .nack(
                &delivery,
                Requeue::After {
                    task: retry,
                    delay: Duration::from_secs(5),
                },
            )
            .await
            .unwrap();

        assert!(queue.try_dequeue(WorkerGroup::Risk).await.unwrap().is_none());
        assert_eq!(queue.depth(WorkerGroup::Risk).await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        let redelivered = queue.try_dequeue(WorkerGroup::Risk).await.unwrap().unwrap();
        assert_eq!(redelivered.task.attempt, 2);
        assert_eq!(redelivered.task.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_and_late_ack_ignored() {
        let queue = InMemoryTaskQueue::new(Duration::from_secs(30));
        queue.enqueue(task(Stage::Ocr), Priority::Normal).await.unwrap();
        let stale = queue.try_dequeue(WorkerGroup::Ocr).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let fresh = queue.try_dequeue(WorkerGroup::Ocr).await.unwrap().unwrap();
        assert_eq!(fresh.task.task_id, stale.task.task_id);
        assert_ne!(fresh.lease_id, stale.lease_id);

        assert!(!queue.ack(&stale).await.unwrap());
        assert!(queue.ack(&fresh).await.unwrap());
        assert_eq!(queue.depth(WorkerGroup::Ocr).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn dead_letters_are_kept_for_inspection() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(task(Stage::Notify), Priority::Low).await.unwrap();
        let delivery = queue
            .try_dequeue(WorkerGroup::Notification)
            .await
            .unwrap()
            .unwrap();
        assert!(queue
            .dead_letter(&delivery, "smtp down".to_string())
            .await
            .unwrap());

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "smtp down");
        assert_eq!(
            queue.depth(WorkerGroup::Notification).await.unwrap(),
            QueueDepth::default()
        );
    }

    #[tokio::test]
    async fn dead_letters_are_capped_and_can_be_taken() {
        let queue = InMemoryTaskQueue::default().with_dead_letter_capacity(2);
        for reason in ["first", "second", "third"] {
            queue.enqueue(task(Stage::Notify), Priority::Low).await.unwrap();
            let delivery = queue
                .try_dequeue(WorkerGroup::Notification)
                .await
                .unwrap()
                .unwrap();
            queue.dead_letter(&delivery, reason.to_string()).await.unwrap();
        }

        let kept = queue.dead_letters().await.unwrap();
        let reasons = kept.iter().map(|d| d.reason.as_str()).collect::<Vec<_>>();
        assert_eq!(reasons, vec!["second", "third"]);

        let taken = queue.take_dead_letters(1).await.unwrap();
        assert_eq!(taken[0].reason, "second");
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
        assert_eq!(queue.take_dead_letters(10).await.unwrap().len(), 1);
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dequeue_returns_none_on_shutdown() {
        let queue = InMemoryTaskQueue::default();
        let (tx, mut rx) = watch::channel(false);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(WorkerGroup::Ocr, &mut rx).await })
        };
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = InMemoryTaskQueue::default();
        let (_tx, mut rx) = watch::channel(false);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(WorkerGroup::Risk, &mut rx).await })
        };
        queue.enqueue(task(Stage::Risk), Priority::Normal).await.unwrap();
        let delivery = waiter.await.unwrap().unwrap().expect("delivered");
        assert_eq!(delivery.task.stage, Stage::Risk);
    }
}
