// SPDX-License-Identifier: GPL-3.0

//! Environment variable names.

/// Variables exported to processes that run against a fork.
pub mod export {
	pub const RPC_URL: &str = "RPC_URL";
	pub const CHAIN_ID: &str = "CHAIN_ID";
	pub const FORK_BLOCK: &str = "FORK_BLOCK";
	pub const FORK_ID: &str = "FORK_ID";
	/// `FORK_BLOCK` value for forks that follow the upstream head.
	pub const LATEST: &str = "latest";
}

/// Variables that override the loaded configuration.
pub mod config {
	pub const DATA_DIR: &str = "FORKBOX_DATA_DIR";
	pub const BASE_PORT: &str = "FORKBOX_BASE_PORT";
	pub const NODE_BINARY: &str = "FORKBOX_NODE_BINARY";
}
