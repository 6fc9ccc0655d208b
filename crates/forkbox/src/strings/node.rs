// SPDX-License-Identifier: GPL-3.0

//! String constants for the node launcher.

/// Default node binary.
pub const DEFAULT_BINARY: &str = "anvil";
/// Loopback host forks bind to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Command-line flags passed to the node.
pub mod args {
	pub const HOST: &str = "--host";
	pub const PORT: &str = "--port";
	pub const FORK_URL: &str = "--fork-url";
	pub const FORK_BLOCK_NUMBER: &str = "--fork-block-number";
}

/// Lowercased stderr fragments reported by a node that failed to bind its port.
pub const BIND_FAILURE_PATTERNS: &[&str] = &[
	"address already in use",
	"address in use",
	"addrinuse",
	"os error 98",
	"os error 48",
];
