// SPDX-License-Identifier: GPL-3.0

//! RPC client error types.

use super::ErrorClass;
use serde_json::Value;
use thiserror::Error;

/// Code reported for failures that never produced a JSON-RPC response (connection errors and
/// non-2xx HTTP statuses).
pub const TRANSPORT_ERROR_CODE: i64 = -32000;
/// Code reported when a response carries neither `result` nor `error`.
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// A JSON-RPC request that failed with a response, or without one for transport reasons.
#[derive(Debug, Error)]
pub enum RpcError {
	/// The request could not be delivered or the response could not be read.
	#[error("RPC request `{method}` to {url} failed: {message}")]
	Transport {
		/// The endpoint the request was sent to.
		url: String,
		/// The JSON-RPC method.
		method: String,
		/// The underlying transport error message.
		message: String,
	},
	/// The endpoint answered with a non-2xx HTTP status.
	#[error("RPC request `{method}` to {url} returned HTTP {status}")]
	Http {
		/// The endpoint the request was sent to.
		url: String,
		/// The JSON-RPC method.
		method: String,
		/// The HTTP status code.
		status: u16,
	},
	/// The node answered with a JSON-RPC error object.
	#[error("RPC request `{method}` failed with code {code}: {message}")]
	Protocol {
		/// The JSON-RPC method.
		method: String,
		/// The error code from the response.
		code: i64,
		/// The error message from the response.
		message: String,
		/// Optional error data from the response.
		data: Option<Value>,
	},
	/// The response contained neither a `result` nor an `error`.
	#[error("RPC response to `{method}` contained neither a result nor an error")]
	MissingResult {
		/// The JSON-RPC method.
		method: String,
	},
	/// The response body could not be decoded.
	#[error("Invalid RPC response to `{method}`: {message}")]
	InvalidResponse {
		/// The JSON-RPC method.
		method: String,
		/// What was wrong with the response.
		message: String,
	},
}

impl RpcError {
	/// The numeric JSON-RPC code for this error, synthetic for transport failures.
	pub fn code(&self) -> i64 {
		match self {
			RpcError::Transport { .. } | RpcError::Http { .. } => TRANSPORT_ERROR_CODE,
			RpcError::Protocol { code, .. } => *code,
			RpcError::MissingResult { .. } | RpcError::InvalidResponse { .. } =>
				INTERNAL_ERROR_CODE,
		}
	}

	/// The JSON-RPC method of the failed request.
	pub fn method(&self) -> &str {
		match self {
			RpcError::Transport { method, .. } |
			RpcError::Http { method, .. } |
			RpcError::Protocol { method, .. } |
			RpcError::MissingResult { method } |
			RpcError::InvalidResponse { method, .. } => method,
		}
	}

	/// The class of this failure.
	pub fn class(&self) -> ErrorClass {
		match self {
			RpcError::Transport { .. } | RpcError::Http { .. } => ErrorClass::Transport,
			_ => ErrorClass::Protocol,
		}
	}
}

/// A JSON-RPC request that received no response before its deadline.
///
/// The request may still have reached the node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("RPC request `{method}` timed out after {timeout_ms}ms")]
pub struct RpcTimeoutError {
	/// The JSON-RPC method.
	pub method: String,
	/// The timeout that elapsed, in milliseconds.
	pub timeout_ms: u64,
}

/// Errors that can occur when interacting with the RPC client.
#[derive(Debug, Error)]
pub enum RpcClientError {
	/// The request failed.
	#[error(transparent)]
	Rpc(#[from] RpcError),
	/// The request timed out.
	#[error(transparent)]
	Timeout(#[from] RpcTimeoutError),
	/// The request was aborted through its cancellation token.
	#[error("RPC request `{method}` was cancelled")]
	Cancelled {
		/// The JSON-RPC method.
		method: String,
	},
	/// The endpoint never answered the readiness probe.
	#[error("{url} did not become ready after {attempts} attempts")]
	NotReady {
		/// The probed endpoint.
		url: String,
		/// How many probes were sent.
		attempts: u32,
	},
}

impl RpcClientError {
	/// The class of this failure. Cancellation shares the timeout class: in both cases the
	/// request may have been applied.
	pub fn class(&self) -> ErrorClass {
		match self {
			RpcClientError::Rpc(e) => e.class(),
			RpcClientError::Timeout(_) | RpcClientError::Cancelled { .. } => ErrorClass::Timeout,
			RpcClientError::NotReady { .. } => ErrorClass::Transport,
		}
	}

	/// Whether the request ran out of time.
	pub fn is_timeout(&self) -> bool {
		matches!(self, RpcClientError::Timeout(_))
	}
}
