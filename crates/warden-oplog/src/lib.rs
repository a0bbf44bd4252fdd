//! # warden-oplog
//!
//! Durable append-only journal of backup operations, plus live event fan-out.
//!
//! The [`OpLog`] stores one row per attempted unit of work in an embedded KV
//! store, indexed by repo, plan, snapshot, and flow. Every committed mutation
//! is delivered to synchronous subscribers in commit order; the [`Broker`]
//! bridges those into buffered per-subscriber streams with drop-oldest
//! backpressure and a `Lost` marker for re-sync.

#![allow(dead_code)]

mod blobs;
mod broker;
mod store;

pub use blobs::{LogStore, UI_LOG_LIMIT};
pub use broker::{Broker, EventStream, HookPhase, OperationEvent, DEFAULT_SUBSCRIBER_BUFFER};
pub use store::{ClearHistoryFilter, OpLog, Query, SubscriptionHandle};
