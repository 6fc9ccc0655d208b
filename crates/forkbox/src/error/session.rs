// SPDX-License-Identifier: GPL-3.0

//! Session error types.

use super::{CheckpointError, ErrorClass, ForkError, SnapshotError, StoreError};
use thiserror::Error;

/// Errors that can occur during session lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
	/// No session with the given id exists.
	#[error("Session {id} not found")]
	NotFound {
		/// The unknown session id.
		id: String,
	},
	/// The fork was not created under this session.
	#[error("Fork {fork_id} does not belong to session {session_id}")]
	ForkNotInSession {
		/// The session id.
		session_id: String,
		/// The fork id.
		fork_id: String,
	},
	/// A fork operation failed.
	#[error(transparent)]
	Fork(#[from] ForkError),
	/// A snapshot operation failed.
	#[error(transparent)]
	Snapshot(#[from] SnapshotError),
	/// A checkpoint operation failed.
	#[error(transparent)]
	Checkpoint(#[from] CheckpointError),
	/// Persisting the session record failed.
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl SessionError {
	/// The class of this failure.
	pub fn class(&self) -> ErrorClass {
		match self {
			SessionError::NotFound { .. } | SessionError::ForkNotInSession { .. } =>
				ErrorClass::NotFound,
			SessionError::Fork(e) => e.class(),
			SessionError::Snapshot(e) => e.class(),
			SessionError::Checkpoint(e) => e.class(),
			SessionError::Store(_) => ErrorClass::Internal,
		}
	}
}
