//! Cluster Coordination Module
//!
//! Everything the state-transfer subsystem needs to know about the rest of the
//! cluster, behind narrow seams.
//!
//! ## Core Concepts
//! - **Buckets**: Keys hash into a fixed number of buckets (`bucket_for_key`); a bucket is the unit of ownership and migration.
//! - **Distribution**: `DistributionMap` records each bucket's permanent owner, temporary owner, status and transfer lock.
//! - **Lock service**: The coordinator node grants bucket locks only to a bucket's temporary owner (`CoordinatorService`).
//! - **Seams**: The transfer driver consumes `ClusterCoordinator` and `OwnershipOracle`; `HttpCoordinator` implements the former over HTTP.

pub mod client;
pub mod coordinator;
pub mod distribution;
pub mod handlers;
pub mod protocol;
pub mod service;
pub mod types;
