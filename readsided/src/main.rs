//! Readside Daemon
//!
//! Projects the tagged event log into the greetings read model, one
//! partition per tag, and serves the operator API.
//!
//! # Usage
//!
//! ```bash
//! # Start with the in-memory backend
//! cargo run -p readsided
//!
//! # Start against PostgreSQL
//! DATABASE_URL=postgres://localhost/readside cargo run -p readsided --features postgres
//!
//! # Schema lifecycle
//! cargo run -p readsided --features postgres -- db init
//! cargo run -p readsided --features postgres -- db rebuild --tag HelloEvent2
//! ```
//!
//! # Environment Variables
//!
//! - `READSIDE_ENV`: Environment (test, development, production)
//! - `READSIDE_API_HOST`: API host (default: 0.0.0.0)
//! - `READSIDE_API_PORT`: API port (default: 8080)
//! - `READSIDE_WORKER_ID`: Worker identity (default: generated)
//! - `READSIDE_TAG_BASE`, `READSIDE_NUM_SHARDS`: Tag set (default: HelloEvent, 4)
//! - `READSIDE_MAX_PARTITIONS`: Partitions owned at once (default: 4)
//! - `READSIDE_LEASE_TTL_MS`, `READSIDE_RENEW_INTERVAL_MS`: Lease timing
//! - `DATABASE_URL`: PostgreSQL connection (feature `postgres`)

use readsided::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("readsided=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("db") {
        #[cfg(feature = "postgres")]
        return readsided::db::run_db_command(args).await;

        #[cfg(not(feature = "postgres"))]
        anyhow::bail!("db commands require the `postgres` feature");
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        worker_id = %config.projection.worker_id,
        api_host = %config.api.host,
        api_port = config.api.port,
        "Readside Daemon"
    );

    let daemon = build_daemon(config).await?;
    daemon.run().await?;

    Ok(())
}

#[cfg(feature = "postgres")]
async fn build_daemon(config: Config) -> anyhow::Result<Daemon> {
    if config.database_url.is_some() {
        return Ok(Daemon::connect(config).await?);
    }
    tracing::warn!("DATABASE_URL not set; using the in-memory backend");
    Ok(Daemon::new_memory(config)?.0)
}

#[cfg(not(feature = "postgres"))]
async fn build_daemon(config: Config) -> anyhow::Result<Daemon> {
    tracing::warn!("Built without `postgres`; using the in-memory backend");
    Ok(Daemon::new_memory(config)?.0)
}
