//! Data Transfer Objects
//!
//! Requests accepted by the run engine and the snapshot event it emits to
//! watchers.

pub mod event;
pub mod log;
pub mod run;
pub mod stage;
