//! Core domain types
//!
//! This module contains the entities tracked by the run engine. A run owns a
//! chain of stages, a stage owns its jobs and a job owns its log records. All
//! ownership is by id; children are loaded on demand.

pub mod chain;
pub mod env;
pub mod job;
pub mod log;
pub mod run;
pub mod stage;
pub mod status;
