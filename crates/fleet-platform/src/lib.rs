//! Fleet Platform - CI platform providers
//!
//! [`PlatformProvider`] is the capability interface for runner registrations
//! on a CI platform. Providers:
//!
//! - [`GitHubPlatform`]: GitHub Actions self-hosted runners (org or repo scope)
//! - [`JobManagerPlatform`]: JobManager REST service
//! - [`MultiplexerPlatform`]: routes between several providers
//! - [`InMemoryPlatform`]: development and testing

#![deny(unsafe_code)]

pub mod error;
pub mod github;
pub mod jobmanager;
pub mod memory;
pub mod multiplexer;
pub mod provider;

pub use error::{PlatformError, PlatformResult};
pub use github::{GitHubConfig, GitHubPath, GitHubPlatform};
pub use jobmanager::{JobManagerConfig, JobManagerPlatform};
pub use memory::InMemoryPlatform;
pub use multiplexer::{MultiplexerPlatform, PlatformBackend, PlatformEntry};
pub use provider::PlatformProvider;
