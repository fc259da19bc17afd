//! Application state wiring all services together.
//!
//! The kernel components are generic over the repository and token codec;
//! `AppState` pins them to the concrete infra implementations and owns the
//! start/stop lifecycle of the background pieces (event bus subscribers,
//! timeout manager).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use signoff_core::approval::ApprovalService;
use signoff_core::event::{DlqSink, EventBus};
use signoff_core::repository::OrchestratorRepository;
use signoff_core::task::TaskRegistry;
use signoff_core::timeout::TimeoutManager;
use signoff_core::workflow::{StateMachine, StepExecutor, WorkflowService};
use signoff_infra::config::OrchestratorConfig;
use signoff_infra::signing::HmacCallbackTokens;
use signoff_infra::sqlite::{DatabasePool, SqliteOrchestratorRepository};

/// Concrete type aliases pinning the kernel generics to infra types.
pub type Repo = SqliteOrchestratorRepository;
pub type Tokens = HmacCallbackTokens;
pub type ConcreteApprovalService = ApprovalService<Repo, Tokens>;
pub type ConcreteWorkflowService = WorkflowService<Repo>;
pub type ConcreteExecutor = StepExecutor<Repo, Tokens>;

/// Shared application state for the REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repo>,
    pub workflows: Arc<ConcreteWorkflowService>,
    pub approvals: Arc<ConcreteApprovalService>,
    pub bus: EventBus,
    pub config: Arc<OrchestratorConfig>,
}

/// Handles for background work, used for graceful shutdown.
pub struct Runtime {
    pub cancel: CancellationToken,
    pub timeout_task: tokio::task::JoinHandle<()>,
}

impl AppState {
    /// Connect to the database, wire every service, register the executor's
    /// bus subscriptions, and start the timeout manager.
    ///
    /// `registry` carries the task handlers registered at startup.
    pub async fn init(
        config: OrchestratorConfig,
        registry: Arc<TaskRegistry>,
    ) -> anyhow::Result<(Self, Runtime)> {
        let pool = DatabasePool::connect(&config.database_url, config.pool.clone()).await?;
        let repo = Arc::new(SqliteOrchestratorRepository::new(pool));

        // Dead-lettered events are persisted through the gateway.
        let dlq_repo = Arc::clone(&repo);
        let sink: DlqSink = Arc::new(move |entry| {
            let repo = Arc::clone(&dlq_repo);
            Box::pin(async move { repo.insert_dlq(&entry).await })
        });
        let bus = EventBus::new(config.bus.clone(), sink);

        let machine = Arc::new(StateMachine::new(Arc::clone(&repo), bus.clone()));
        let tokens = Arc::new(HmacCallbackTokens::new(config.signing_key.clone()));
        let approvals = Arc::new(ApprovalService::new(
            Arc::clone(&repo),
            tokens,
            bus.clone(),
        ));
        let workflows = Arc::new(WorkflowService::new(Arc::clone(&repo), bus.clone()));

        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&repo),
            Arc::clone(&machine),
            Arc::clone(&approvals),
            registry,
            bus.clone(),
            config.approval.clone(),
        ));
        executor.subscribe();

        let cancel = CancellationToken::new();
        let timeouts = Arc::new(TimeoutManager::new(
            Arc::clone(&repo),
            machine,
            bus.clone(),
            config.timeout.clone(),
        ));
        let timeout_task = timeouts.spawn(cancel.clone());

        let state = Self {
            repo,
            workflows,
            approvals,
            bus: bus.clone(),
            config: Arc::new(config),
        };
        let runtime = Runtime {
            cancel,
            timeout_task,
        };
        Ok((state, runtime))
    }
}

impl Runtime {
    /// Stop background work: the timeout manager finishes its in-flight
    /// tick, then the bus drains and joins its subscriber tasks.
    pub async fn shutdown(self, bus: &EventBus) {
        self.cancel.cancel();
        let _ = self.timeout_task.await;
        bus.shutdown().await;
    }
}
