//! iKYC daemon wiring: store, queue, worker pool and maintenance scheduler.

#![deny(unsafe_code)]

use ikyc_core::{
    bootstrap_ticket_store, AdapterRegistry, CompositeRiskEvaluator, DocumentRefs, IKycConfig,
    IKycError, InMemoryTaskQueue, KycTier, MaintenanceSchedule, MaintenanceScheduler,
    Orchestrator, PersistentAuditLog, RiskEvaluator, SubjectFields, Submission, TicketFilter,
    TicketStatus, WorkerGroup, WorkerPool,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] IKycError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct ServiceState {
    config: Arc<IKycConfig>,
    orchestrator: Orchestrator,
    pool: Arc<WorkerPool>,
    scheduler: Arc<MaintenanceScheduler>,
}

impl ServiceState {
    /// Wire the pipeline with the composite risk evaluator from `config`.
    pub async fn bootstrap(
        config: IKycConfig,
        adapters: AdapterRegistry,
    ) -> Result<Self, ServiceError> {
        let risk = Arc::new(CompositeRiskEvaluator::with_weights(
            config.thresholds.clone(),
            config.risk.clone(),
        ));
        Self::bootstrap_with(config, adapters, risk).await
    }

    pub async fn bootstrap_with(
        config: IKycConfig,
        adapters: AdapterRegistry,
        risk: Arc<dyn RiskEvaluator>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let store = bootstrap_ticket_store(&config.storage).await?;
        let audit = PersistentAuditLog::bootstrap(&config.storage).await?;
        let queue = Arc::new(
            InMemoryTaskQueue::new(config.workers.visibility_timeout())
                .with_dead_letter_capacity(config.workers.dead_letter_capacity),
        );

        let mut settings = config.orchestrator_settings();
        if settings.anchoring_enabled && !adapters.has_anchor() {
            tracing::warn!("Anchoring enabled but no ledger anchor configured, disabling");
            settings.anchoring_enabled = false;
        }

        let orchestrator = Orchestrator::new(
            store,
            queue.clone(),
            config.thresholds.clone(),
            settings,
        )
        .with_audit_log(audit);

        let pool = WorkerGroup::ALL.into_iter().fold(
            WorkerPool::new(orchestrator.clone(), adapters, risk)
                .with_policies(config.stage_policies()),
            |pool, group| pool.with_concurrency(group, config.workers.concurrency(group)),
        );

        let scheduler = MaintenanceScheduler::new(
            queue,
            MaintenanceSchedule::from_config(&config.retention),
        );

        tracing::info!(
            storage = config.storage.label(),
            anchoring = orchestrator.settings().anchoring_enabled,
            "iKYC pipeline bootstrapped"
        );

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            pool: Arc::new(pool),
            scheduler: Arc::new(scheduler),
        })
    }

    pub fn config(&self) -> &IKycConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    pub fn scheduler(&self) -> Arc<MaintenanceScheduler> {
        self.scheduler.clone()
    }

    /// Run workers and maintenance loops until `shutdown` resolves, then let
    /// every worker settle its current task.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServiceError>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = self.pool.clone().spawn(stop_rx.clone());
        handles.extend(self.scheduler.clone().spawn(stop_rx));

        shutdown.await;
        tracing::info!("Shutdown requested, draining workers");
        // Receivers are held by the spawned tasks.
        let _ = stop_tx.send(true);

        for handle in handles {
            handle.await?;
        }
        tracing::info!("iKYC pipeline stopped");
        Ok(())
    }

    /// Push `count` synthetic submissions through the pipeline in-process.
    pub async fn demo(&self, count: usize) -> Result<DemoReport, ServiceError> {
        let submissions = {
            let mut rng = rand::thread_rng();
            (0..count)
                .map(|index| synthetic_submission(&mut rng, index))
                .collect::<Vec<_>>()
        };
        let mut submitted = Vec::with_capacity(count);
        for submission in submissions {
            submitted.push(self.orchestrator.submit(submission).await?);
        }

        let deliveries = self.pool.drain().await?;

        let mut by_status = BTreeMap::new();
        for ticket_id in &submitted {
            let ticket = self.orchestrator.get_status(*ticket_id).await?;
            *by_status.entry(ticket.status).or_insert(0) += 1;
        }
        let pending_review = self.orchestrator.list_pending_review().await?.len();
        let dead_letters = self.orchestrator.queue().dead_letters().await?.len();
        let audit = self.orchestrator.audit_log();
        let audit = audit.lock().await;

        let report = DemoReport {
            submitted: submitted.len(),
            deliveries,
            by_status,
            pending_review,
            dead_letters,
            audit_entries: audit.len(),
            audit_chain_verified: audit.verify_chain(),
        };
        tracing::info!(
            submitted = report.submitted,
            deliveries = report.deliveries,
            pending_review = report.pending_review,
            dead_letters = report.dead_letters,
            "Demo batch finished"
        );
        Ok(report)
    }

    /// Number of tickets currently in `status`.
    pub async fn count(&self, status: TicketStatus) -> Result<usize, ServiceError> {
        Ok(self
            .orchestrator
            .list_tickets(&TicketFilter::with_status(status))
            .await?
            .len())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub submitted: usize,
    pub deliveries: usize,
    pub by_status: BTreeMap<TicketStatus, usize>,
    pub pending_review: usize,
    pub dead_letters: usize,
    pub audit_entries: usize,
    pub audit_chain_verified: bool,
}

const GIVEN_NAMES: [&str; 8] = [
    "Amara", "Bao", "Carmen", "Dmitri", "Elif", "Farid", "Greta", "Hiro",
];
const FAMILY_NAMES: [&str; 8] = [
    "Okafor", "Nguyen", "Silva", "Volkov", "Yilmaz", "Haddad", "Lund", "Tanaka",
];

fn synthetic_submission(rng: &mut impl Rng, index: usize) -> Submission {
    let given = GIVEN_NAMES.choose(rng).copied().unwrap_or("Alex");
    let family = FAMILY_NAMES.choose(rng).copied().unwrap_or("Doe");
    let tier = if rng.gen_bool(0.7) {
        KycTier::Full
    } else {
        KycTier::Basic
    };
    let birth_year = rng.gen_range(1950..2005);
    let reference = format!("{index:05}-{:08x}", rng.gen::<u32>());

    let subject = SubjectFields::new(
        format!("{given} {family}"),
        format!("{birth_year}-0{}-1{}", rng.gen_range(1..10), rng.gen_range(0..10)),
        format!("{} Harbour Road", rng.gen_range(1..500)),
        tier,
    )
    .with_contact(
        Some(format!("{}.{}@example.com", given, family).to_lowercase()),
        None,
    );
    let documents = DocumentRefs::new(
        format!("demo://{reference}/front"),
        format!("demo://{reference}/back"),
        format!("demo://{reference}/selfie"),
    );
    Submission::new(subject, documents).with_idempotency_key(format!("demo-{reference}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikyc_adapters::simulated_registry;

    #[tokio::test(start_paused = true)]
    async fn demo_resolves_every_ticket() {
        let state = ServiceState::bootstrap(IKycConfig::default(), simulated_registry(0.55, &[]))
            .await
            .unwrap();
        let report = state.demo(12).await.unwrap();

        assert_eq!(report.submitted, 12);
        let resolved: usize = [
            TicketStatus::Approved,
            TicketStatus::Rejected,
            TicketStatus::ManualReview,
        ]
        .iter()
        .map(|status| report.by_status.get(status).copied().unwrap_or(0))
        .sum();
        assert_eq!(resolved, 12);
        assert_eq!(report.dead_letters, 0);
        assert!(report.audit_chain_verified);
    }

    #[tokio::test]
    async fn missing_anchor_disables_anchoring() {
        let adapters = AdapterRegistry::new();
        let state = ServiceState::bootstrap(IKycConfig::default(), adapters)
            .await
            .unwrap();
        assert!(!state.orchestrator().settings().anchoring_enabled);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = IKycConfig::default();
        config.thresholds.auto_approval_threshold = 1.5;
        match ServiceState::bootstrap(config, AdapterRegistry::new()).await {
            Err(ServiceError::Core(IKycError::Config(_))) => {}
            Err(other) => panic!("expected config error, got {other:?}"),
            Ok(_) => panic!("expected config error, got a running state"),
        }
    }
}
