//! Relay Core
//!
//! Core types and rules for the Relay pipeline-run ledger.
//!
//! This crate contains:
//! - Domain types: runs, stages, jobs, job logs and the shared status enum
//! - Status derivation and environment resolution (pure functions)
//! - DTOs: requests accepted by the engine and the snapshot event it emits

pub mod domain;
pub mod dto;
