//! Reconcile loop scheduling

mod reconciler;

pub use reconciler::Scheduler;
