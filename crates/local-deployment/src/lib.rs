use std::sync::Arc;

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use services::services::{
    config::{Config, LlmConfig, load_or_init},
    llm::LlmAgentInvoker,
};
use tokio::sync::RwLock;
use ts_rs::TS;
use utils::assets::ensure_asset_dir;
use workflow::{
    AgentInvoker, BroadcastRegistry, EventBus, StatusProjector, WorkflowOrchestrator,
    WorkflowStore,
    persona::{AgentPersona, PersonaInfo},
    status::{StatusProgress, StepView},
    store::{MemoryWorkflowStore, SqliteWorkflowStore},
    types::{AgentSelector, PlannedStep, StepStatus, WorkflowContext},
};

#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<RwLock<Config>>,
    store: Arc<dyn WorkflowStore>,
    orchestrator: WorkflowOrchestrator,
    status: StatusProjector,
    broadcasts: Arc<BroadcastRegistry>,
}

impl LocalDeployment {
    /// Wire a deployment from already-built parts, then start the relay and
    /// the step deadline sweep.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn WorkflowStore>,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Self {
        let events = EventBus::new(config.event_buffer);
        let orchestrator_config = config.orchestrator_config();
        let sweep_period = orchestrator_config.sweep_period();
        let orchestrator = WorkflowOrchestrator::new(
            Arc::clone(&store),
            invoker,
            events,
            orchestrator_config,
        );
        if let Some(period) = sweep_period {
            tracing::debug!("Sweeping expired steps every {:?}", period);
            orchestrator.spawn_deadline_sweep(period);
        }
        let deployment = Self {
            status: StatusProjector::new(Arc::clone(&store)),
            broadcasts: Arc::new(BroadcastRegistry::new()),
            config: Arc::new(RwLock::new(config)),
            store,
            orchestrator,
        };
        deployment.spawn_relay();
        deployment
    }

    /// Ephemeral deployment backed by the in-memory store and default config.
    pub fn in_memory(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self::from_parts(
            Config::default(),
            Arc::new(MemoryWorkflowStore::new()),
            invoker,
        )
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let asset_dir = ensure_asset_dir()?;
        tracing::info!("Using asset directory {}", asset_dir.display());

        let config = load_or_init().await?;
        let db = DBService::new().await?;
        let store: Arc<dyn WorkflowStore> = Arc::new(SqliteWorkflowStore::new(db));
        let invoker: Arc<dyn AgentInvoker> = Arc::new(LlmAgentInvoker::new(config.llm.clone()));

        match config.step_timeout_secs {
            Some(secs) => tracing::info!("Step deadline set to {}s", secs),
            None => tracing::warn!("Step deadline disabled, stuck steps need an operator"),
        }

        Ok(Self::from_parts(config, store, invoker))
    }

    fn shared_types() -> Vec<String> {
        vec![
            AgentPersona::decl(),
            PersonaInfo::decl(),
            WorkflowContext::decl(),
            AgentSelector::decl(),
            PlannedStep::decl(),
            workflow::WorkflowStatus::decl(),
            StepStatus::decl(),
            workflow::WorkflowRecord::decl(),
            workflow::StartWorkflowRequest::decl(),
            StatusProgress::decl(),
            StepView::decl(),
            workflow::StatusView::decl(),
            LlmConfig::decl(),
            Config::decl(),
        ]
    }

    fn config(&self) -> &Arc<RwLock<Config>> {
        &self.config
    }

    fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.orchestrator
    }

    fn status(&self) -> &StatusProjector {
        &self.status
    }

    fn broadcasts(&self) -> &Arc<BroadcastRegistry> {
        &self.broadcasts
    }
}
