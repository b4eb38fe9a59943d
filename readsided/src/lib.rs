//! Readside Daemon Library
//!
//! Worker process of the read side.
//!
//! # Architecture
//!
//! ```text
//! Event Log ──► Projection Worker (per tag) ──► Projector ──► Offset Store
//!                      │                            │          + read model
//!                 lease permits              Partition Coordinator
//!                      │
//!               Partition Board ◄── API (status, restart, metrics)
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **Projection Worker**: Claims a tag, runs its projector, retries later
//! - **Partition Board**: Per-tag status and restart handles
//! - **API**: HTTP endpoints for operators
//! - **Metrics**: Prometheus export of partition status
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use readsided::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let (daemon, _log) = Daemon::new_memory(config).expect("Failed to build daemon");
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod metrics;
pub mod projection_worker;

#[cfg(feature = "postgres")]
pub mod db;

// Re-exports for convenience
pub use config::{ApiConfig, Config, Environment, ProjectionConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use metrics::ProjectionMetrics;
pub use projection_worker::{PartitionBoard, PartitionHandle, ProjectionWorker};
