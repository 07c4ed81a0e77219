//! opsync: File-Mailbox Operation Queue
//!
//! Two peers, a client and a worker, share no memory and exchange work
//! through three JSON documents in a mailbox directory: the queue, the sync
//! state and the results. This crate holds the coordinator both peers run,
//! conflict detection and resolution between queued operations, and the
//! crash-safe document store underneath.

pub mod cli;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod mailbox;
pub mod operation;
pub mod store;
pub mod worker;
