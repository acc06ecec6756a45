//! Service Module
//!
//! Business logic layer for the run engine.
//! Services orchestrate between the store and the notifier and contain domain logic.

pub mod run;

pub use run::{RunError, RunService};
