//! # drudge-core
//!
//! Core types, traits, and abstractions for the drudge job queue.
//!
//! This crate provides the job and cron records, the [`JobStore`] contract
//! every store implements, the shared error type and the worker event bus.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, WorkerEvent};
pub use models::*;
pub use traits::*;
