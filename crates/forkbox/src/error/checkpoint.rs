// SPDX-License-Identifier: GPL-3.0

//! Checkpoint error types.

use super::{ErrorClass, RpcClientError, SnapshotError, StoreError};
use thiserror::Error;

/// Errors that can occur when creating or restoring checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
	/// No checkpoint with the given id exists in this session.
	#[error("Checkpoint {id} not found")]
	NotFound {
		/// The unknown checkpoint id.
		id: String,
	},
	/// The node no longer holds the checkpoint's snapshot.
	#[error("Checkpoint {id} is stale: snapshot {snapshot_id} is no longer available")]
	Stale {
		/// The checkpoint id.
		id: String,
		/// The snapshot the node no longer holds.
		snapshot_id: String,
	},
	/// The request targets a different session than the manager owns.
	#[error("Checkpoint manager for session {expected} cannot serve session {actual}")]
	SessionMismatch {
		/// The manager's session id.
		expected: String,
		/// The session id in the request.
		actual: String,
	},
	/// Taking the underlying snapshot failed.
	#[error(transparent)]
	Snapshot(#[from] SnapshotError),
	/// An RPC call failed while restoring a checkpoint.
	#[error("Failed to {operation} checkpoint {checkpoint_id}: {source}")]
	Rpc {
		/// The operation that failed.
		operation: &'static str,
		/// The checkpoint being operated on.
		checkpoint_id: String,
		/// The underlying RPC error.
		#[source]
		source: RpcClientError,
	},
	/// The node returned a value that could not be interpreted.
	#[error("Invalid response while restoring checkpoint {checkpoint_id}: {message}")]
	InvalidResponse {
		/// The checkpoint being operated on.
		checkpoint_id: String,
		/// What was wrong with the response.
		message: String,
	},
	/// Persisting the checkpoint index failed.
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl CheckpointError {
	/// The class of this failure.
	pub fn class(&self) -> ErrorClass {
		match self {
			CheckpointError::NotFound { .. } => ErrorClass::NotFound,
			CheckpointError::Stale { .. } => ErrorClass::Stale,
			CheckpointError::SessionMismatch { .. } => ErrorClass::Conflict,
			CheckpointError::Snapshot(e) => e.class(),
			CheckpointError::Rpc { source, .. } => source.class(),
			CheckpointError::InvalidResponse { .. } => ErrorClass::Protocol,
			CheckpointError::Store(_) => ErrorClass::Internal,
		}
	}

	/// Whether the checkpoint must be replaced by a fresh one rather than retried.
	pub fn is_stale(&self) -> bool {
		matches!(self, CheckpointError::Stale { .. })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::RpcError;

	#[test]
	fn stale_is_distinct_from_protocol_failures() {
		let stale = CheckpointError::Stale { id: "cp".to_string(), snapshot_id: "0x2".to_string() };
		assert!(stale.is_stale());
		assert_eq!(stale.class(), ErrorClass::Stale);

		let rpc = CheckpointError::Rpc {
			operation: "restore",
			checkpoint_id: "cp".to_string(),
			source: RpcError::Protocol {
				method: "evm_revert".to_string(),
				code: -32000,
				message: "boom".to_string(),
				data: None,
			}
			.into(),
		};
		assert!(!rpc.is_stale());
		assert_eq!(rpc.class(), ErrorClass::Protocol);
		assert_eq!(
			rpc.to_string(),
			"Failed to restore checkpoint cp: RPC request `evm_revert` failed with code -32000: boom"
		);
	}
}
