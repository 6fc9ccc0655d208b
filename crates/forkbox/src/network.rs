// SPDX-License-Identifier: GPL-3.0

//! Upstream networks that forks can be created from.

use crate::error::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{EnumProperty, VariantArray};
use strum_macros::{Display, EnumProperty, EnumString, VariantArray};
use url::Url;

/// An upstream chain a fork is created from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkConfig {
	/// Human readable network name, used for lookups.
	pub name: String,
	/// The chain id reported by the network.
	pub chain_id: u64,
	/// The upstream RPC endpoint the node forks from.
	pub rpc_url: String,
}

impl NetworkConfig {
	/// Creates a network description.
	pub fn new(name: impl Into<String>, chain_id: u64, rpc_url: impl Into<String>) -> Self {
		Self { name: name.into(), chain_id, rpc_url: rpc_url.into() }
	}

	/// Checks that the chain id is positive and the RPC URL is an http(s) or ws(s) URL.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let invalid = |message: String| ConfigError::InvalidNetwork {
			name: self.name.clone(),
			message,
		};
		if self.name.is_empty() {
			return Err(invalid("name must not be empty".into()));
		}
		if self.chain_id == 0 {
			return Err(invalid("chain id must be positive".into()));
		}
		let url = Url::parse(&self.rpc_url).map_err(|e| invalid(format!("bad rpc url: {e}")))?;
		match url.scheme() {
			"http" | "https" | "ws" | "wss" => Ok(()),
			scheme => Err(invalid(format!("unsupported rpc url scheme `{scheme}`"))),
		}
	}
}

/// Networks known without any configuration.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumProperty, VariantArray,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SupportedNetworks {
	/// Ethereum mainnet.
	#[strum(props(RpcUrl = "https://ethereum-rpc.publicnode.com"))]
	Mainnet,
	/// Ethereum Sepolia testnet.
	#[strum(props(RpcUrl = "https://ethereum-sepolia-rpc.publicnode.com"))]
	Sepolia,
	/// Ethereum Holesky testnet.
	#[strum(props(RpcUrl = "https://ethereum-holesky-rpc.publicnode.com"))]
	Holesky,
	/// Base.
	#[strum(props(RpcUrl = "https://mainnet.base.org"))]
	Base,
	/// OP Mainnet.
	#[strum(props(RpcUrl = "https://mainnet.optimism.io"))]
	Optimism,
	/// Arbitrum One.
	#[strum(props(RpcUrl = "https://arb1.arbitrum.io/rpc"))]
	Arbitrum,
	/// Polygon PoS.
	#[strum(props(RpcUrl = "https://polygon-rpc.com"))]
	Polygon,
}

impl SupportedNetworks {
	/// The chain id of the network.
	pub fn chain_id(&self) -> u64 {
		match self {
			SupportedNetworks::Mainnet => 1,
			SupportedNetworks::Sepolia => 11_155_111,
			SupportedNetworks::Holesky => 17_000,
			SupportedNetworks::Base => 8_453,
			SupportedNetworks::Optimism => 10,
			SupportedNetworks::Arbitrum => 42_161,
			SupportedNetworks::Polygon => 137,
		}
	}

	/// The public RPC endpoint of the network.
	pub fn rpc_url(&self) -> &'static str {
		self.get_str("RpcUrl").unwrap_or_default()
	}

	/// The network as a [`NetworkConfig`].
	pub fn config(&self) -> NetworkConfig {
		NetworkConfig::new(self.to_string(), self.chain_id(), self.rpc_url())
	}
}

/// Lookup table from network name to [`NetworkConfig`].
///
/// Starts from [`SupportedNetworks`]; configured networks with the same name replace the
/// built-in entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRegistry {
	networks: IndexMap<String, NetworkConfig>,
}

impl Default for NetworkRegistry {
	fn default() -> Self {
		let networks = SupportedNetworks::VARIANTS
			.iter()
			.map(|n| (n.to_string(), n.config()))
			.collect();
		Self { networks }
	}
}

impl NetworkRegistry {
	/// The built-in networks extended with `networks`, each validated first.
	pub fn with_networks(
		networks: impl IntoIterator<Item = NetworkConfig>,
	) -> Result<Self, ConfigError> {
		let mut registry = Self::default();
		for network in networks {
			network.validate()?;
			registry.networks.insert(network.name.to_lowercase(), network);
		}
		Ok(registry)
	}

	/// Looks up a network by name, ignoring case.
	pub fn get(&self, name: &str) -> Option<&NetworkConfig> {
		self.networks.get(&name.to_lowercase())
	}

	/// Looks up a network by name, failing with the list of known names.
	pub fn resolve(&self, name: &str) -> Result<NetworkConfig, ConfigError> {
		self.get(name).cloned().ok_or_else(|| ConfigError::InvalidNetwork {
			name: name.to_string(),
			message: format!("unknown network, expected one of: {}", self.names().join(", ")),
		})
	}

	/// Registered network names, built-ins first.
	pub fn names(&self) -> Vec<&str> {
		self.networks.keys().map(String::as_str).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn supported_networks_parse_and_display() {
		assert_eq!(SupportedNetworks::from_str("Mainnet"), Ok(SupportedNetworks::Mainnet));
		assert_eq!(SupportedNetworks::from_str("base"), Ok(SupportedNetworks::Base));
		assert!(SupportedNetworks::from_str("dogechain").is_err());
		assert_eq!(SupportedNetworks::Arbitrum.to_string(), "arbitrum");
	}

	#[test]
	fn supported_networks_have_valid_configs() {
		for network in SupportedNetworks::VARIANTS {
			let config = network.config();
			assert!(config.validate().is_ok(), "{network} is invalid");
			assert!(!network.rpc_url().is_empty());
		}
		assert_eq!(SupportedNetworks::Mainnet.chain_id(), 1);
		assert_eq!(SupportedNetworks::Sepolia.chain_id(), 11155111);
	}

	#[test]
	fn registry_resolves_builtins_case_insensitively() {
		let registry = NetworkRegistry::default();
		assert_eq!(registry.get("MAINNET").map(|n| n.chain_id), Some(1));
		assert_eq!(registry.names().len(), SupportedNetworks::VARIANTS.len());
	}

	#[test]
	fn configured_networks_override_builtins() -> anyhow::Result<()> {
		let registry = NetworkRegistry::with_networks([
			NetworkConfig::new("mainnet", 1, "http://localhost:9000"),
			NetworkConfig::new("devnet", 31337, "http://localhost:9001"),
		])?;
		assert_eq!(registry.resolve("mainnet")?.rpc_url, "http://localhost:9000");
		assert_eq!(registry.resolve("devnet")?.chain_id, 31337);
		assert_eq!(registry.names().last(), Some(&"devnet"));
		Ok(())
	}

	#[test]
	fn invalid_networks_are_rejected() {
		let zero = NetworkConfig::new("zero", 0, "http://localhost:9000");
		assert!(matches!(zero.validate(), Err(ConfigError::InvalidNetwork { .. })));
		let bad_url = NetworkConfig::new("bad", 5, "not a url");
		assert!(NetworkRegistry::with_networks([bad_url]).is_err());
		let ftp = NetworkConfig::new("ftp", 5, "ftp://example.com");
		assert!(ftp.validate().is_err());
	}

	#[test]
	fn resolve_unknown_network_lists_known_names() {
		let err = NetworkRegistry::default().resolve("nowhere").unwrap_err();
		assert!(err.to_string().contains("mainnet"));
	}
}
