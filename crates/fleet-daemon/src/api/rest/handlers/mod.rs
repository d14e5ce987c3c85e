//! API request handlers

mod health;
mod metrics;
mod reconcile;
mod runners;

pub use health::*;
pub use metrics::*;
pub use reconcile::*;
pub use runners::*;
