//! Fleet daemon library
//!
//! This module provides the core components for the fleet daemon:
//! - Configuration loading and validation
//! - Backend construction from configuration
//! - Reconcile loop scheduling
//! - Operational REST API
//! - Server lifecycle management

pub mod api;
pub mod backends;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError};
pub use scheduler::Scheduler;
pub use server::Server;
