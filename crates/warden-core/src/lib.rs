//! # warden-core
//!
//! Core types for the warden backup supervisor.
//!
//! Warden drives a restic-compatible backup binary across multiple
//! repositories on user-declared schedules. This crate holds the vocabulary
//! shared by every other workspace member:
//!
//! - Operation rows and their lifecycle statuses
//! - User intent: repositories, plans, retention and prune policies
//! - The unified error type

#![allow(dead_code)]

mod config;
mod error;
mod types;

pub use config::{Config, Hook, HookErrorPolicy, Plan, PrunePolicy, Repo, RetentionPolicy};
pub use error::{truncate_output, Result, WardenError};
pub use types::*;
