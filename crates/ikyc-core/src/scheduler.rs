//! Periodic maintenance: retention purge, audit rotation and stalled sweep.
//!
//! The scheduler only enqueues; the maintenance worker group does the work,
//! so a slow purge never delays the next tick of another job.

use crate::config::RetentionConfig;
use crate::error::IKycError;
use crate::queue::{Priority, StageTask, TaskQueue};
use crate::stage::Stage;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSchedule {
    pub purge_every: Duration,
    pub rotation_every: Duration,
    pub stall_sweep_every: Duration,
}

impl MaintenanceSchedule {
    pub fn from_config(retention: &RetentionConfig) -> Self {
        Self {
            purge_every: Duration::from_secs(retention.purge_interval_secs),
            rotation_every: Duration::from_secs(retention.rotation_interval_secs),
            stall_sweep_every: Duration::from_secs(retention.stall_sweep_interval_secs),
        }
    }

    fn jobs(&self) -> [(Stage, Duration); 3] {
        [
            (Stage::RetentionPurge, self.purge_every),
            (Stage::AuditRotation, self.rotation_every),
            (Stage::StalledSweep, self.stall_sweep_every),
        ]
    }
}

pub struct MaintenanceScheduler {
    queue: Arc<dyn TaskQueue>,
    schedule: MaintenanceSchedule,
}

impl MaintenanceScheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, schedule: MaintenanceSchedule) -> Self {
        Self { queue, schedule }
    }

    pub fn schedule(&self) -> MaintenanceSchedule {
        self.schedule
    }

    /// Enqueue one maintenance run immediately.
    pub async fn trigger(&self, stage: Stage) -> Result<(), IKycError> {
        if !stage.is_maintenance() {
            return Err(IKycError::Queue(format!("{stage} is not a maintenance stage")));
        }
        self.queue
            .enqueue(StageTask::maintenance(stage), Priority::Low)
            .await
    }

    /// One loop per job. The first run happens one period after start.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let handles = self
            .schedule
            .jobs()
            .into_iter()
            .map(|(stage, period)| {
                let scheduler = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if let Err(e) = scheduler.trigger(stage).await {
                                    tracing::error!(stage = %stage, error = %e, "Maintenance scheduling failed");
                                } else {
                                    tracing::debug!(stage = %stage, "Maintenance run scheduled");
                                }
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        tracing::info!(
            purge_every_secs = self.schedule.purge_every.as_secs(),
            rotation_every_secs = self.schedule.rotation_every.as_secs(),
            stall_sweep_every_secs = self.schedule.stall_sweep_every.as_secs(),
            "Maintenance scheduler started"
        );
        handles
    }
}
