// SPDX-License-Identifier: GPL-3.0

//! Error types for sandbox operations.
//!
//! This module contains all error types used throughout the `forkbox` crate,
//! organized by context:
//!
//! - [`rpc::RpcClientError`] - Errors from JSON-RPC calls against a node.
//! - [`fork::ForkError`] - Errors from spawning, tracking and killing forks.
//! - [`snapshot::SnapshotError`] - Errors from capturing snapshots.
//! - [`checkpoint::CheckpointError`] - Errors from creating and restoring checkpoints.
//! - [`session::SessionError`] - Errors from session lifecycle operations.
//! - [`graph::GraphError`] - Errors from task graph mutations.
//! - [`store::StoreError`] - Errors from reading and writing session records.
//! - [`config::ConfigError`] - Errors from loading configuration.
//!
//! Every error can be reduced to an [`ErrorClass`], which is what callers branch on.

pub mod checkpoint;
pub mod config;
pub mod fork;
pub mod graph;
pub mod rpc;
pub mod session;
pub mod snapshot;
pub mod store;

pub use checkpoint::CheckpointError;
pub use config::ConfigError;
pub use fork::ForkError;
pub use graph::GraphError;
pub use rpc::{RpcClientError, RpcError, RpcTimeoutError};
pub use session::SessionError;
pub use snapshot::SnapshotError;
pub use store::StoreError;

use strum_macros::Display;
use thiserror::Error;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorClass {
	/// The node could not be reached. Retryable.
	Transport,
	/// The node did not answer in time; the request may still have been applied.
	Timeout,
	/// The node answered with an error object. Not retryable without changing the request.
	Protocol,
	/// An unknown fork, snapshot, checkpoint, session or task id was used.
	NotFound,
	/// The request conflicts with current state (port in use, cycle, invalid transition).
	Conflict,
	/// A snapshot or checkpoint is no longer valid on the node.
	Stale,
	/// Local failure: process management, persistence or configuration.
	Internal,
}

/// Any error produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
	/// A checkpoint operation failed.
	#[error(transparent)]
	Checkpoint(#[from] CheckpointError),
	/// The configuration could not be loaded.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// A fork could not be started, found or stopped.
	#[error(transparent)]
	Fork(#[from] ForkError),
	/// A task graph operation failed.
	#[error(transparent)]
	Graph(#[from] GraphError),
	/// A JSON-RPC call failed.
	#[error(transparent)]
	Rpc(#[from] RpcClientError),
	/// A session operation failed.
	#[error(transparent)]
	Session(#[from] SessionError),
	/// A snapshot operation failed.
	#[error(transparent)]
	Snapshot(#[from] SnapshotError),
	/// A session record could not be read or written.
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl Error {
	/// The class of the underlying failure.
	pub fn class(&self) -> ErrorClass {
		match self {
			Error::Checkpoint(e) => e.class(),
			Error::Config(_) => ErrorClass::Internal,
			Error::Fork(e) => e.class(),
			Error::Graph(e) => e.class(),
			Error::Rpc(e) => e.class(),
			Error::Session(e) => e.class(),
			Error::Snapshot(e) => e.class(),
			Error::Store(_) => ErrorClass::Internal,
		}
	}
}
