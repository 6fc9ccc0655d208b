// SPDX-License-Identifier: GPL-3.0

//! Fork lifecycle error types.

use super::{ErrorClass, RpcClientError};
use thiserror::Error;

/// Errors that can occur when spawning, tracking or killing forks.
#[derive(Debug, Error)]
pub enum ForkError {
	/// No fork with the given id is registered.
	#[error("Fork {id} not found")]
	NotFound {
		/// The unknown fork id.
		id: String,
	},
	/// The node could not bind its port.
	#[error("Port {port} is already in use")]
	PortInUse {
		/// The contested port.
		port: u16,
	},
	/// No bindable port was found at or above the base port.
	#[error("No free port available at or above {base}")]
	NoFreePort {
		/// The first port that was scanned.
		base: u16,
	},
	/// The node process could not be started.
	#[error("Failed to spawn node on port {port}: {message}")]
	Spawn {
		/// The port the node was asked to bind.
		port: u16,
		/// The underlying error message.
		message: String,
	},
	/// The node process exited before becoming ready.
	#[error("Node on port {port} exited before becoming ready ({status}): {stderr}")]
	ProcessExited {
		/// The port the node was asked to bind.
		port: u16,
		/// The exit status, as reported by the OS.
		status: String,
		/// The tail of the node's stderr.
		stderr: String,
	},
	/// The node never answered the readiness probe.
	#[error("Node on port {port} did not become ready after {attempts} attempts")]
	StartupTimeout {
		/// The port the node was asked to bind.
		port: u16,
		/// How many probes were sent.
		attempts: u32,
	},
	/// Terminating the node process failed.
	#[error("Failed to kill fork {id}: {message}")]
	Kill {
		/// The fork whose process could not be terminated.
		id: String,
		/// The underlying error message.
		message: String,
	},
	/// An RPC call against the fork failed.
	#[error(transparent)]
	Rpc(#[from] RpcClientError),
}

impl ForkError {
	/// The class of this failure.
	pub fn class(&self) -> ErrorClass {
		match self {
			ForkError::NotFound { .. } => ErrorClass::NotFound,
			ForkError::PortInUse { .. } => ErrorClass::Conflict,
			ForkError::StartupTimeout { .. } => ErrorClass::Timeout,
			ForkError::Rpc(e) => e.class(),
			ForkError::NoFreePort { .. } |
			ForkError::Spawn { .. } |
			ForkError::ProcessExited { .. } |
			ForkError::Kill { .. } => ErrorClass::Internal,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn port_in_use_is_a_conflict() {
		let err = ForkError::PortInUse { port: 8545 };
		assert_eq!(err.to_string(), "Port 8545 is already in use");
		assert_eq!(err.class(), ErrorClass::Conflict);
	}

	#[test]
	fn not_found_names_the_fork() {
		let err = ForkError::NotFound { id: "abc".to_string() };
		assert_eq!(err.to_string(), "Fork abc not found");
		assert_eq!(err.class(), ErrorClass::NotFound);
	}

	#[test]
	fn startup_timeout_is_timeout_class() {
		let err = ForkError::StartupTimeout { port: 8546, attempts: 50 };
		assert_eq!(err.class(), ErrorClass::Timeout);
		assert_eq!(err.to_string(), "Node on port 8546 did not become ready after 50 attempts");
	}
}
