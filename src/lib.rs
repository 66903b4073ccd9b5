pub mod adapter;
pub mod adapters;
pub mod auth;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod events;
pub mod ingest;
pub mod migrations;
pub mod models;
pub mod registry;
pub mod sessions;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

use auth::DeviceAuthService;
use catalog::MetricCatalog;
use commands::CommandDispatcher;
use config::SolarfluxConfig;
use events::EventJournal;
use ingest::TelemetryIngest;
use registry::DeviceRegistry;
use sessions::SessionManager;

/// Aggregate handle over the telemetry-plane services, sharing one
/// connection pool.
#[derive(Clone)]
pub struct TelemetryPlane {
    pub pool: PgPool,
    pub registry: Arc<DeviceRegistry>,
    pub catalog: Arc<MetricCatalog>,
    pub ingest: Arc<TelemetryIngest>,
    pub events: Arc<EventJournal>,
    pub commands: Arc<CommandDispatcher>,
    pub auth: Arc<DeviceAuthService>,
    pub sessions: Arc<SessionManager>,
}

impl TelemetryPlane {
    /// Connect the pool, apply schema and policies (unless disabled), seed
    /// the metric catalog and wire up the services.
    pub async fn connect(config: &SolarfluxConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await?;

        if config.database.run_migrations {
            migrations::run(&pool, &config.retention).await?;
        }

        let plane = Self::from_pool(pool, config);
        plane.catalog.seed_defaults().await?;
        Ok(plane)
    }

    /// Wire services over an existing pool without touching the schema.
    pub fn from_pool(pool: PgPool, config: &SolarfluxConfig) -> Self {
        let registry = Arc::new(DeviceRegistry::new(
            pool.clone(),
            config.auth.token_expiry_days,
        ));
        let catalog = Arc::new(MetricCatalog::new(pool.clone()));
        let ingest = Arc::new(TelemetryIngest::new(pool.clone(), catalog.clone()));
        let events = Arc::new(EventJournal::new(pool.clone()));
        let commands = Arc::new(
            CommandDispatcher::new(pool.clone(), Some(events.clone())).with_execute_timeout(
                std::time::Duration::from_secs(config.commands.execute_timeout_secs),
            ),
        );
        let auth = Arc::new(DeviceAuthService::new(registry.clone(), &config.auth));
        let sessions = Arc::new(SessionManager::new(registry.clone(), events.clone()));

        Self {
            pool,
            registry,
            catalog,
            ingest,
            events,
            commands,
            auth,
            sessions,
        }
    }

    /// Spawn the background sweeps: command expiry and cleanup, stale
    /// sessions and the auth lockout table.
    pub fn spawn_background_engines(&self, config: &SolarfluxConfig) {
        use std::time::Duration;

        commands::spawn_command_sweeper(
            self.commands.clone(),
            Duration::from_secs(config.commands.expire_sweep_secs),
        );
        commands::spawn_command_cleanup(self.commands.clone(), config.commands.keep_days);
        sessions::spawn_session_sweeper(
            self.sessions.clone(),
            Duration::from_secs(config.sessions.inactivity_timeout_secs),
            Duration::from_secs(config.sessions.sweep_interval_secs),
        );
        auth::spawn_lockout_sweeper(
            self.auth.clone(),
            Duration::from_secs(config.sessions.sweep_interval_secs),
        );
    }
}
