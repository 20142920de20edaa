//! # drudge-db
//!
//! Job store implementations for the drudge job queue.
//!
//! This crate provides:
//! - [`PgJobStore`]: PostgreSQL store with `SKIP LOCKED` claims, queue locks
//!   and `LISTEN`/`NOTIFY` wake-ups across processes
//! - [`MemoryJobStore`]: in-process store with the same contract
//! - Connection pool management and schema installation
//!
//! ## Example
//!
//! ```rust,ignore
//! use drudge_db::{JobSpec, JobStore, PgJobStore, PoolConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PgJobStore::connect("postgres://localhost/app", "drudge", PoolConfig::default()).await?;
//!     store.install().await?;
//!
//!     let job = store
//!         .add_job(JobSpec::new("send_email", json!({"to": "ops@example.com"})).with_queue("mail"))
//!         .await?;
//!     println!("Queued job {}", job.id);
//!     Ok(())
//! }
//! ```
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod schema;

// Always compiled so integration tests (in tests/) can use it.
pub mod test_fixtures;

// Re-export core types
pub use drudge_core::*;

pub use jobs::PgJobStore;
pub use memory::MemoryJobStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use schema::{drop_schema, insert_channel, install_schema, validate_schema_name};
