use std::sync::Arc;

use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use services::services::config::{Config, ConfigError};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::{sync::RwLock, task::JoinHandle};
use workflow::{
    BroadcastRegistry, StatusProjector, StoreError, StreamRelay, WorkflowOrchestrator,
    WorkflowStore,
};

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn shared_types() -> Vec<String>;

    fn config(&self) -> &Arc<RwLock<Config>>;

    fn store(&self) -> &Arc<dyn WorkflowStore>;

    fn orchestrator(&self) -> &WorkflowOrchestrator;

    fn status(&self) -> &StatusProjector;

    fn broadcasts(&self) -> &Arc<BroadcastRegistry>;

    /// Forward every orchestrator event to the broadcast registry.
    fn spawn_relay(&self) -> JoinHandle<()> {
        let receiver = self.orchestrator().events().subscribe();
        tracing::info!("[RELAY] Starting stream relay");
        StreamRelay::new(Arc::clone(self.broadcasts())).spawn(receiver)
    }
}
