//! Partitioned Cache Cluster Library
//!
//! This library crate defines the modules a cache node is built from.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`cluster`**: The bucket table, the coordinator's lock service and the
//!   client other nodes use to reach it.
//! - **`storage`**: The bucket-partitioned in-memory store, with per-bucket
//!   operation logging and freezing used during a handover.
//! - **`transfer`**: Bucket state transfer. The pulling driver on the new owner
//!   and the serving corresponder on the current one.
//! - **`config`**: Node and transfer settings.
//! - **`error`**: Error types shared by the modules above.

pub mod cluster;
pub mod config;
pub mod error;
pub mod storage;
pub mod transfer;
