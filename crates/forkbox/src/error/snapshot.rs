// SPDX-License-Identifier: GPL-3.0

//! Snapshot error types.

use super::{ErrorClass, RpcClientError, StoreError};
use thiserror::Error;

/// Errors that can occur when capturing or managing snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
	/// The request targets a different session than the manager owns.
	#[error("Snapshot manager for session {expected} cannot serve session {actual}")]
	SessionMismatch {
		/// The manager's session id.
		expected: String,
		/// The session id in the request.
		actual: String,
	},
	/// An RPC call failed while capturing a snapshot.
	#[error("Failed to {operation} on fork {fork_id}: {source}")]
	Rpc {
		/// The operation that failed.
		operation: &'static str,
		/// The fork the call targeted.
		fork_id: String,
		/// The underlying RPC error.
		#[source]
		source: RpcClientError,
	},
	/// The node returned a value that is not a valid snapshot id or block number.
	#[error("Invalid response from fork {fork_id}: {message}")]
	InvalidResponse {
		/// The fork the call targeted.
		fork_id: String,
		/// What was wrong with the response.
		message: String,
	},
	/// No snapshot with the given id exists in this session.
	#[error("Snapshot {id} not found")]
	NotFound {
		/// The unknown snapshot id.
		id: String,
	},
	/// Persisting the snapshot index failed.
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl SnapshotError {
	/// The class of this failure.
	pub fn class(&self) -> ErrorClass {
		match self {
			SnapshotError::SessionMismatch { .. } => ErrorClass::Conflict,
			SnapshotError::Rpc { source, .. } => source.class(),
			SnapshotError::InvalidResponse { .. } => ErrorClass::Protocol,
			SnapshotError::NotFound { .. } => ErrorClass::NotFound,
			SnapshotError::Store(_) => ErrorClass::Internal,
		}
	}
}
