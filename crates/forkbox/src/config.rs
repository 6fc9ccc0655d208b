// SPDX-License-Identifier: GPL-3.0

//! Sandbox configuration.
//!
//! Configuration is read from a TOML file and then adjusted through `FORKBOX_*` environment
//! variables. Every field has a default, so an absent file or an empty table is a valid
//! configuration:
//!
//! ```toml
//! data_dir = "/var/tmp/forkbox"
//! base_port = 9545
//! rpc_timeout_ms = 2000
//!
//! [readiness]
//! max_attempts = 100
//! interval_ms = 100
//!
//! [node]
//! binary = "/usr/local/bin/anvil"
//! extra_args = ["--no-rate-limit"]
//!
//! [[networks]]
//! name = "devnet"
//! chain_id = 31337
//! rpc_url = "http://10.0.0.2:8545"
//! ```

use crate::{
	error::ConfigError,
	network::{NetworkConfig, NetworkRegistry},
	strings::{env::config as env_keys, node, store::SESSIONS_DIR},
};
use serde::{Deserialize, Serialize};
use std::{
	env, fs,
	path::{Path, PathBuf},
	time::Duration,
};

/// The first port scanned when a fork does not request one.
pub const DEFAULT_BASE_PORT: u16 = 8545;
/// Default per-call RPC timeout.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;

/// Top-level sandbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
	/// Directory holding persisted session records.
	pub data_dir: PathBuf,
	/// The first port scanned when a fork does not request one.
	pub base_port: u16,
	/// Per-call RPC timeout, in milliseconds.
	pub rpc_timeout_ms: u64,
	/// How long to wait for a new fork to answer.
	pub readiness: ReadinessConfig,
	/// How the node process is launched.
	pub node: NodeConfig,
	/// Networks added to (or replacing) the built-in ones.
	pub networks: Vec<NetworkConfig>,
}

impl Default for SandboxConfig {
	fn default() -> Self {
		Self {
			data_dir: default_data_dir(),
			base_port: DEFAULT_BASE_PORT,
			rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
			readiness: ReadinessConfig::default(),
			node: NodeConfig::default(),
			networks: Vec::new(),
		}
	}
}

/// Bounded readiness polling of a freshly spawned fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
	/// Number of probes before giving up.
	pub max_attempts: u32,
	/// Delay between probes, in milliseconds.
	pub interval_ms: u64,
	/// How long a node must stay up after answering before it counts as ready, in
	/// milliseconds. Catches nodes that lost a port race to another listener.
	pub settle_ms: u64,
}

impl Default for ReadinessConfig {
	fn default() -> Self {
		Self { max_attempts: 50, interval_ms: 200, settle_ms: 100 }
	}
}

impl ReadinessConfig {
	/// Delay between probes.
	pub fn interval(&self) -> Duration {
		Duration::from_millis(self.interval_ms)
	}

	/// How long a node must stay up after answering.
	pub fn settle(&self) -> Duration {
		Duration::from_millis(self.settle_ms)
	}
}

/// Node process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
	/// Binary name or path.
	pub binary: String,
	/// Host the node binds to.
	pub host: String,
	/// Arguments appended to every launch.
	pub extra_args: Vec<String>,
}

impl Default for NodeConfig {
	fn default() -> Self {
		Self {
			binary: node::DEFAULT_BINARY.to_string(),
			host: node::DEFAULT_HOST.to_string(),
			extra_args: Vec::new(),
		}
	}
}

impl SandboxConfig {
	/// Loads the configuration at `path`, falling back to defaults when the file does not exist.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		if !path.exists() {
			log::debug!("No config at {}, using defaults", path.display());
			return Ok(Self::default());
		}
		let contents = fs::read_to_string(path)
			.map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
		let config: Self = toml::from_str(&contents)?;
		for network in &config.networks {
			network.validate()?;
		}
		Ok(config)
	}

	/// Applies `FORKBOX_DATA_DIR`, `FORKBOX_BASE_PORT` and `FORKBOX_NODE_BINARY`.
	pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
		if let Ok(dir) = env::var(env_keys::DATA_DIR) {
			self.data_dir = PathBuf::from(dir);
		}
		if let Ok(port) = env::var(env_keys::BASE_PORT) {
			self.base_port = match port.trim().parse::<u16>() {
				Ok(port) if port > 0 => port,
				_ => return Err(ConfigError::InvalidEnv { key: env_keys::BASE_PORT, value: port }),
			};
		}
		if let Ok(binary) = env::var(env_keys::NODE_BINARY) {
			if binary.trim().is_empty() {
				return Err(ConfigError::InvalidEnv { key: env_keys::NODE_BINARY, value: binary });
			}
			self.node.binary = binary;
		}
		Ok(self)
	}

	/// Per-call RPC timeout.
	pub fn rpc_timeout(&self) -> Duration {
		Duration::from_millis(self.rpc_timeout_ms)
	}

	/// Directory holding one record per session.
	pub fn sessions_dir(&self) -> PathBuf {
		self.data_dir.join(SESSIONS_DIR)
	}

	/// The built-in networks merged with the configured ones.
	pub fn network_registry(&self) -> Result<NetworkRegistry, ConfigError> {
		NetworkRegistry::with_networks(self.networks.iter().cloned())
	}
}

fn default_data_dir() -> PathBuf {
	dirs::cache_dir().unwrap_or_else(env::temp_dir).join("forkbox")
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn load_missing_file_returns_defaults() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let config = SandboxConfig::load(&dir.path().join("forkbox.toml"))?;
		assert_eq!(config, SandboxConfig::default());
		assert_eq!(config.base_port, 8545);
		assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
		assert_eq!(
			config.readiness,
			ReadinessConfig { max_attempts: 50, interval_ms: 200, settle_ms: 100 }
		);
		assert_eq!(config.node.binary, "anvil");
		assert!(config.data_dir.ends_with("forkbox"));
		Ok(())
	}

	#[test]
	fn load_partial_file_keeps_defaults() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let path = dir.path().join("forkbox.toml");
		fs::write(
			&path,
			r#"
base_port = 9545

[readiness]
interval_ms = 10

[[networks]]
name = "devnet"
chain_id = 31337
rpc_url = "http://127.0.0.1:9000"
"#,
		)?;
		let config = SandboxConfig::load(&path)?;
		assert_eq!(config.base_port, 9545);
		assert_eq!(config.readiness.interval_ms, 10);
		assert_eq!(config.readiness.max_attempts, 50);
		assert_eq!(config.node, NodeConfig::default());
		assert_eq!(config.network_registry()?.resolve("devnet")?.chain_id, 31337);
		Ok(())
	}

	#[test]
	fn load_rejects_invalid_toml() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let path = dir.path().join("forkbox.toml");
		fs::write(&path, "base_port = \"high\"")?;
		assert!(matches!(SandboxConfig::load(&path), Err(ConfigError::Toml(_))));
		Ok(())
	}

	#[test]
	fn load_rejects_invalid_network() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let path = dir.path().join("forkbox.toml");
		fs::write(&path, "[[networks]]\nname = \"broken\"\nchain_id = 0\nrpc_url = \"http://x\"\n")?;
		assert!(matches!(SandboxConfig::load(&path), Err(ConfigError::InvalidNetwork { .. })));
		Ok(())
	}

	#[test]
	fn env_overrides_apply() {
		temp_env::with_vars(
			[
				(env_keys::DATA_DIR, Some("/tmp/forkbox-test")),
				(env_keys::BASE_PORT, Some("10545")),
				(env_keys::NODE_BINARY, Some("/opt/anvil")),
			],
			|| {
				let config = SandboxConfig::default().with_env_overrides().unwrap();
				assert_eq!(config.data_dir, PathBuf::from("/tmp/forkbox-test"));
				assert_eq!(config.sessions_dir(), PathBuf::from("/tmp/forkbox-test/sessions"));
				assert_eq!(config.base_port, 10545);
				assert_eq!(config.node.binary, "/opt/anvil");
			},
		);
	}

	#[test]
	fn env_override_rejects_bad_port() {
		temp_env::with_vars(
			[(env_keys::BASE_PORT, Some("0")), (env_keys::NODE_BINARY, None::<&str>)],
			|| {
				let err = SandboxConfig::default().with_env_overrides().unwrap_err();
				assert!(matches!(err, ConfigError::InvalidEnv { key: "FORKBOX_BASE_PORT", .. }));
			},
		);
		temp_env::with_var(env_keys::BASE_PORT, Some("not-a-port"), || {
			assert!(SandboxConfig::default().with_env_overrides().is_err());
		});
	}
}
