// SPDX-License-Identifier: GPL-3.0

//! String constants for the RPC client module.

/// JSON-RPC protocol version sent with every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC method names understood by the forked node.
pub mod methods {
	/// Capture the node state, returning an opaque snapshot id.
	pub const EVM_SNAPSHOT: &str = "evm_snapshot";
	/// Revert to a snapshot id, returning whether the snapshot existed.
	pub const EVM_REVERT: &str = "evm_revert";
	/// Current block height as a hex quantity.
	pub const ETH_BLOCK_NUMBER: &str = "eth_blockNumber";
	/// Chain id as a hex quantity. Used as the readiness probe.
	pub const ETH_CHAIN_ID: &str = "eth_chainId";
}
