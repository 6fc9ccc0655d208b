// SPDX-License-Identifier: GPL-3.0

//! Session store error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when reading or writing persisted session records.
#[derive(Debug, Error)]
pub enum StoreError {
	/// A filesystem operation failed.
	#[error("Failed to {operation} {}: {source}", path.display())]
	Io {
		/// The operation that failed.
		operation: &'static str,
		/// The file or directory involved.
		path: PathBuf,
		/// The underlying IO error.
		#[source]
		source: std::io::Error,
	},
	/// A session record could not be serialized.
	#[error("Failed to encode session {session_id}: {source}")]
	Encode {
		/// The session being written.
		session_id: String,
		/// The underlying serialization error.
		#[source]
		source: serde_json::Error,
	},
	/// The session id cannot be used as a file name.
	#[error("Invalid session id `{id}`")]
	InvalidId {
		/// The rejected id.
		id: String,
	},
}
