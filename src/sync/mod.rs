// src/sync/mod.rs
//! Offline mutation queue and its remote endpoint

pub mod mutation;
pub mod queue;
pub mod remote;

pub use mutation::{Mutation, PendingMutation};
pub use queue::{BatchPolicy, FlushBatch, SyncQueue};
pub use remote::{HttpRemote, RemoteEndpoint};
