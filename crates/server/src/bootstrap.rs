use std::sync::Arc;

use setter_agent::{ConversationEngine, ConversationSettings, PromptError};
use setter_core::config::{AppConfig, ConfigError};
use setter_core::orchestrator::OrchestratorConfig;
use setter_core::ports::{LeadSource, SchedulingService};
use setter_db::repositories::{
    SqlCallRecordRepository, SqlDeadLetterRepository, SqlTransitionLogRepository,
};
use setter_db::{
    connect_with_settings, migrations, CallRecordRepository, DbPool, DeadLetterRepository,
    TransitionLogRepository,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::adapters::{
    http_client, ChatCompletionClient, CrmLeadSource, DisabledScheduling, HttpScheduling,
    TwilioTelephony,
};
use crate::dispatcher::Collaborators;

const COLLABORATOR_TIMEOUT_SECS: u64 = 15;

pub struct Application {
    pub config: AppConfig,
    pub orchestrator_config: OrchestratorConfig,
    pub db_pool: DbPool,
    pub transition_log: Arc<dyn TransitionLogRepository>,
    pub records: Arc<dyn CallRecordRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub collaborators: Collaborators,
    /// `None` when CRM polling is disabled.
    pub lead_source: Option<Arc<dyn LeadSource>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("http client could not be built: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("conversation templates are invalid: {0}")]
    Prompt(#[from] PromptError),
}

/// Connects storage and builds every collaborator from an already loaded
/// config, so logging can be initialized from the same values first.
pub async fn bootstrap(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let orchestrator_config = config.orchestrator_config()?;

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
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

    let collaborators_client =
        http_client(COLLABORATOR_TIMEOUT_SECS).map_err(BootstrapError::HttpClient)?;
    let llm_client = http_client(config.llm.timeout_secs).map_err(BootstrapError::HttpClient)?;

    let llm = Arc::new(ChatCompletionClient::new(llm_client, &config.llm));
    let engine = ConversationEngine::new(
        llm,
        ConversationSettings::from_config(&config.conversation),
    )?;

    let scheduling: Arc<dyn SchedulingService> =
        match HttpScheduling::from_config(collaborators_client.clone(), &config.scheduling) {
            Some(scheduling) => Arc::new(scheduling),
            None => {
                warn!(
                    event_name = "system.bootstrap.scheduling_disabled",
                    correlation_id = "bootstrap",
                    "no scheduling service configured, qualified leads need manual booking"
                );
                Arc::new(DisabledScheduling)
            }
        };

    let lead_source = CrmLeadSource::from_config(collaborators_client.clone(), &config.crm)
        .map(|source| Arc::new(source) as Arc<dyn LeadSource>);
    info!(
        event_name = "system.bootstrap.collaborators_ready",
        correlation_id = "bootstrap",
        llm_provider = ?config.llm.provider,
        crm_polling = lead_source.is_some(),
        "collaborator adapters initialized"
    );

    let collaborators = Collaborators {
        telephony: Arc::new(TwilioTelephony::new(collaborators_client, &config.telephony)),
        scheduling,
        engine: Arc::new(engine),
    };

    Ok(Application {
        orchestrator_config,
        transition_log: Arc::new(SqlTransitionLogRepository::new(db_pool.clone())),
        records: Arc::new(SqlCallRecordRepository::new(db_pool.clone())),
        dead_letters: Arc::new(SqlDeadLetterRepository::new(db_pool.clone())),
        db_pool,
        collaborators,
        lead_source,
        config,
    })
}
