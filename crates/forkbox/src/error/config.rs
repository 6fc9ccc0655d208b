// SPDX-License-Identifier: GPL-3.0

//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when loading sandbox configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The configuration file could not be read.
	#[error("Failed to read config {}: {source}", path.display())]
	Io {
		/// The configuration file.
		path: PathBuf,
		/// The underlying IO error.
		#[source]
		source: std::io::Error,
	},
	/// The configuration file is not valid TOML for this schema.
	#[error("Invalid config: {0}")]
	Toml(#[from] toml::de::Error),
	/// An environment override has an unusable value.
	#[error("Invalid value `{value}` for {key}")]
	InvalidEnv {
		/// The environment variable.
		key: &'static str,
		/// The rejected value.
		value: String,
	},
	/// A configured network is malformed.
	#[error("Invalid network `{name}`: {message}")]
	InvalidNetwork {
		/// The network name.
		name: String,
		/// What is wrong with it.
		message: String,
	},
}
