//! Bucket State Transfer Module
//!
//! Moves bucket data to a node's new buckets after a rebalance.
//!
//! ## Core Concepts
//! - **Pull model**: The new owner asks the current owner for one unit at a time (`StateTransferTask`).
//! - **Corresponder**: The current owner serves each requester from a per-bucket cursor, then from the operation log.
//! - **Transfer id**: A growing id acknowledges the previous unit; repeating an id gets the same unit again.
//! - **Packs**: Buckets queued per owner, small (sparsed) ones pulled together, filled ones one by one.
//! - **Locks**: Every pass holds the coordinator's bucket lock and releases it exactly once.

pub mod client;
pub mod corresponder;
pub mod handlers;
pub mod protocol;
pub mod scheduler;
pub mod source;
pub mod task;
pub mod throttle;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod testkit;
#[cfg(test)]
mod tests;
