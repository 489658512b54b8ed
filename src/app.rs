//! Wiring of stores, providers, and pipelines from configuration.

use std::sync::Arc;

use casefile_core::embedding::Embedder;
use casefile_core::store::Store;

use crate::agent::{AgentSettings, Orchestrator};
use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::ingest::Ingestor;
use crate::llm::{create_model, ChatModel};
use crate::migrate;
use crate::sqlite_store::SqliteStore;
use crate::tools::ToolRegistry;

/// Everything a command or the server needs, built once.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub embedder: Arc<dyn Embedder>,
    pub model: Arc<dyn ChatModel>,
    pub ingestor: Arc<Ingestor>,
    pub orchestrator: Orchestrator,
}

impl App {
    /// Connect to the configured database (migrating it if needed) and providers.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let embedder = create_provider(&config.embedding)?;
        let model = create_model(&config.models)?;
        Self::from_parts(config, store, embedder, model)
    }

    /// Assemble from explicit components.
    pub fn from_parts(
        config: &Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
    ) -> anyhow::Result<Self> {
        let ingestor = Ingestor::new(config, store.clone(), embedder.clone(), model.clone())?;
        let orchestrator = Orchestrator::new(
            store.clone(),
            embedder.clone(),
            model.clone(),
            ToolRegistry::with_builtins(),
            AgentSettings::from_config(config),
        );
        Ok(Self {
            config: Arc::new(config.clone()),
            store,
            embedder,
            model,
            ingestor: Arc::new(ingestor),
            orchestrator,
        })
    }
}
