use std::sync::Arc;

use datapilot_agent::{
    AgentRuntime, BroadcastProgressSink, LlmError, OpenAiCompatibleClient, RuntimeBuildError,
    RuntimeDeps,
};
use datapilot_core::config::{AppConfig, ConfigError, LoadOptions};
use datapilot_core::ApplicationError;
use datapilot_db::{connect_with_config, migrations, DbPool, SqlCheckpointStore};
use datapilot_mcp::{McpError, McpToolProvider};
use thiserror::Error;
use tracing::info;

const PROGRESS_CAPACITY: usize = 256;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub tools: Arc<McpToolProvider>,
    pub progress: BroadcastProgressSink,
    pub agent_runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("tool provider setup failed: {0}")]
    Tools(#[from] McpError),
    #[error("llm client setup failed: {0}")]
    Llm(#[from] LlmError),
    #[error("agent runtime setup failed: {0}")]
    Runtime(#[from] RuntimeBuildError),
}

impl From<BootstrapError> for ApplicationError {
    fn from(value: BootstrapError) -> Self {
        match value {
            BootstrapError::Config(error) => error.into(),
            error @ (BootstrapError::Tools(_) | BootstrapError::Runtime(_)) => {
                Self::Configuration(error.to_string())
            }
            error @ (BootstrapError::DatabaseConnect(_) | BootstrapError::Migration(_)) => {
                Self::Persistence(error.to_string())
            }
            error @ BootstrapError::Llm(_) => Self::Integration(error.to_string()),
        }
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let tools = Arc::new(McpToolProvider::from_config(&config.mcp)?);
    let llm = Arc::new(OpenAiCompatibleClient::from_config(&config.llm)?);
    let progress = BroadcastProgressSink::new(PROGRESS_CAPACITY);

    let agent_runtime = AgentRuntime::new(
        &config.agent,
        RuntimeDeps {
            llm,
            tools: tools.clone(),
            checkpoints: Arc::new(SqlCheckpointStore::new(db_pool.clone())),
            progress: Arc::new(progress.clone()),
        },
    )
    .await?;

    info!(
        event_name = "system.bootstrap.runtime_ready",
        correlation_id = "bootstrap",
        llm_provider = config.llm.provider.as_str(),
        llm_model = %config.llm.model,
        backends = tools.backend_count(),
        tools = agent_runtime.bound_tool_count().await,
        "agent runtime initialized"
    );

    Ok(Application { config, db_pool, tools, progress, agent_runtime: Arc::new(agent_runtime) })
}
