//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Event log, offset store and partition coordinator (memory or PostgreSQL)
//! - One projection worker per tag partition
//! - API Server (HTTP endpoints)
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Initialize components
//! 3. Prepare the read-side schema (fatal on failure)
//! 4. Start API server
//! 5. Spawn one projection worker per tag
//! 6. Graceful shutdown on SIGINT: cancel workers, release leases

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use readside_domain::AggregateEventTag;
use readside_eventlog::{EventLog, MemoryEventLog};
use readside_projector::{greetings_registry, prepare, HandlerRegistry, Projector};
use readside_store::{MemoryCoordinator, MemoryStore, PartitionCoordinator, Store};

use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::ProjectionMetrics;
use crate::projection_worker::{PartitionBoard, ProjectionWorker};

// =============================================================================
// Daemon
// =============================================================================

/// The readside worker daemon.
pub struct Daemon {
    /// Configuration
    config: Config,
    /// Tag set projected by this process
    tags: AggregateEventTag,
    store: Arc<dyn Store>,
    coordinator: Arc<dyn PartitionCoordinator>,
    /// One projector per tag
    board: PartitionBoard,
    metrics: Arc<ProjectionMetrics>,
    /// Cancels workers and the API server
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a daemon over in-memory components (for testing/development).
    ///
    /// Returns the log so callers can append events to it.
    pub fn new_memory(config: Config) -> DaemonResult<(Self, Arc<MemoryEventLog>)> {
        let tags = config.projection.tags()?;
        let log = Arc::new(MemoryEventLog::new(tags));
        let daemon = Self::new(
            config,
            log.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCoordinator::new()),
        )?;
        Ok((daemon, log))
    }

    /// Create a daemon backed by PostgreSQL.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: Config) -> DaemonResult<Self> {
        use readside_eventlog::PgEventLog;
        use readside_store::{PgCoordinator, PgStore};

        let url = config.database_url.clone().ok_or_else(|| {
            DaemonError::Config("DATABASE_URL is required for the PostgreSQL backend".to_string())
        })?;
        let pool = sqlx::PgPool::connect(&url)
            .await
            .map_err(|e| DaemonError::Database(e.to_string()))?;
        info!("Connected to PostgreSQL");

        let tags = config.projection.tags()?;
        Self::new(
            config,
            Arc::new(PgEventLog::new(pool.clone(), tags)),
            Arc::new(PgStore::new(pool.clone())),
            Arc::new(PgCoordinator::new(pool)),
        )
    }

    /// Create a new daemon with provided components.
    pub fn new(
        config: Config,
        log: Arc<dyn EventLog>,
        store: Arc<dyn Store>,
        coordinator: Arc<dyn PartitionCoordinator>,
    ) -> DaemonResult<Self> {
        let registry = Arc::new(greetings_registry()?);
        Self::with_registry(config, log, store, coordinator, registry)
    }

    /// Create a daemon with a caller-built handler registry.
    pub fn with_registry(
        config: Config,
        log: Arc<dyn EventLog>,
        store: Arc<dyn Store>,
        coordinator: Arc<dyn PartitionCoordinator>,
        registry: Arc<HandlerRegistry>,
    ) -> DaemonResult<Self> {
        config.projection.validate()?;
        let tags = config.projection.tags()?;
        let projector_config = config.projection.projector_config();

        let board = PartitionBoard::new(tags.all_tags().into_iter().map(|tag| {
            Arc::new(Projector::new(
                tag,
                log.clone(),
                store.clone(),
                coordinator.clone(),
                registry.clone(),
                projector_config.clone(),
            ))
        }));

        Ok(Self {
            config,
            tags,
            store,
            coordinator,
            board,
            metrics: Arc::new(ProjectionMetrics::new()?),
            shutdown: CancellationToken::new(),
        })
    }

    /// Partitions of this daemon (shares status with the running workers).
    pub fn board(&self) -> PartitionBoard {
        self.board.clone()
    }

    /// Token that stops the daemon when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT).
    pub async fn run(self) -> DaemonResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await
    }

    /// Run the daemon until `signal` completes or the shutdown token is cancelled.
    pub async fn run_until<F>(self, signal: F) -> DaemonResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            worker_id = %self.config.projection.worker_id,
            tags = self.tags.num_shards(),
            max_partitions = self.config.projection.max_partitions,
            "Starting readside daemon"
        );

        // 1. Schema must exist before any event is applied
        prepare(self.store.as_ref()).await?;

        // 2. Start API server
        let api_addr = self.start_api_server().await?;
        info!(%api_addr, "API server started");

        // 3. One worker per tag
        let workers = self.spawn_workers();
        info!(count = workers.len(), "Projection workers started");

        tokio::select! {
            _ = signal => {}
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        // 4. Graceful shutdown
        self.shutdown(workers).await
    }

    fn spawn_workers(&self) -> Vec<JoinHandle<DaemonResult<()>>> {
        let permits = Arc::new(Semaphore::new(self.config.projection.max_partitions));

        self.board
            .handles()
            .map(|partition| {
                let worker = ProjectionWorker::new(
                    partition.clone(),
                    permits.clone(),
                    self.config.projection.claim_interval(),
                    self.config.projection.retry_policy(),
                );
                tokio::spawn(worker.run(self.shutdown.clone()))
            })
            .collect()
    }

    /// Start the API server.
    async fn start_api_server(&self) -> DaemonResult<SocketAddr> {
        let state = Arc::new(ApiState {
            worker_id: self.config.projection.worker_id.clone(),
            board: self.board.clone(),
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            metrics: self.metrics.clone(),
        });

        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            DaemonError::Config(format!("Failed to bind to {}: {}", addr, e))
        })?;

        let local_addr = listener.local_addr().map_err(|e| {
            DaemonError::Config(format!("Failed to get local address: {}", e))
        })?;

        // Spawn the server task
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }

    /// Graceful shutdown.
    async fn shutdown(&self, workers: Vec<JoinHandle<DaemonResult<()>>>) -> DaemonResult<()> {
        info!("Initiating graceful shutdown");
        self.shutdown.cancel();

        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(error = %e, "Projection worker ended with error"),
                Err(e) => error!(error = %e, "Projection worker panicked"),
            }
        }

        let owned = self.board.statuses().iter().filter(|s| s.owner.is_some()).count();
        info!(owned_partitions = owned, "Shutdown complete");

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use readside_store::OffsetStore;

    #[tokio::test]
    async fn test_daemon_memory_creation() {
        let config = Config::test();
        let (daemon, _log) = Daemon::new_memory(config).unwrap();

        assert_eq!(daemon.board().len(), 2);
        assert!(daemon.board().statuses().iter().all(|s| s.owner.is_none()));
    }

    #[tokio::test]
    async fn test_daemon_api_server_start() {
        let config = Config::test();
        let (daemon, _log) = Daemon::new_memory(config).unwrap();

        let addr = daemon.start_api_server().await.unwrap();

        // Server should be running on a port
        assert!(addr.port() > 0);
        daemon.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_run_prepares_schema_and_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let config = Config::test();
        let log = Arc::new(MemoryEventLog::new(config.projection.tags().unwrap()));
        let daemon =
            Daemon::new(config, log, store.clone(), Arc::new(MemoryCoordinator::new())).unwrap();
        let token = daemon.shutdown_token();

        let handle = tokio::spawn(daemon.run_until(std::future::pending()));
        token.cancel();

        handle.await.unwrap().unwrap();
        assert!(store.schema_ready());
        assert!(store.load(&readside_domain::Tag::new("HelloEvent0").unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_projection_config_rejected() {
        let mut config = Config::test();
        config.projection.max_partitions = 0;

        assert!(matches!(Daemon::new_memory(config), Err(DaemonError::Config(_))));
    }
}
