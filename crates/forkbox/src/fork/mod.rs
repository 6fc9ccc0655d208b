// SPDX-License-Identifier: GPL-3.0

//! Spawning and tracking forked nodes.
//!
//! A fork moves through `spawning -> ready -> killed`. While spawning, an automatically chosen
//! port is reserved so that concurrent [`ForkManager::fork`] calls never pick the same one. A
//! caller-supplied port is not checked up front: if it is taken, the node fails to bind and
//! the call fails with [`ForkError::PortInUse`]. A node started on a port another fork already
//! holds is never registered, even if its bind failure arrives late.
//!
//! The registry is only touched under a short synchronous lock that is never held across an
//! await, so [`ForkManager::get`] and [`ForkManager::list`] are plain synchronous lookups.

mod launcher;

pub use launcher::{AnvilLauncher, LaunchSpec, NodeExit, NodeLauncher, NodeProcess};

use crate::{
	config::{ReadinessConfig, SandboxConfig},
	error::ForkError,
	events::{EventBus, EventKind, ForkEvent},
	network::NetworkConfig,
	rpc::RpcClient,
	strings::env::export,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{
	collections::{BTreeMap, HashMap},
	net::TcpListener,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A ready fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fork {
	/// Generated id, stable for the lifetime of the fork.
	pub id: String,
	/// The upstream network.
	pub network: NetworkConfig,
	/// The local endpoint of the fork.
	pub rpc_url: String,
	/// The port the node listens on.
	pub port: u16,
	/// The node's OS process id.
	pub pid: u32,
	/// The pinned block, if any.
	pub block_number: Option<u64>,
}

/// What to fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkConfig {
	/// The upstream network.
	pub network: NetworkConfig,
	/// Pin the fork at this block. `None` follows the upstream head.
	pub block_number: Option<u64>,
	/// Listen on this port. `None` picks the lowest free port at or above the base port.
	pub port: Option<u16>,
}

impl ForkConfig {
	/// Forks the head of `network` on an automatically chosen port.
	pub fn new(network: NetworkConfig) -> Self {
		Self { network, block_number: None, port: None }
	}

	/// Pins the fork at `block_number`.
	pub fn at_block(mut self, block_number: u64) -> Self {
		self.block_number = Some(block_number);
		self
	}

	/// Listens on `port`.
	pub fn on_port(mut self, port: u16) -> Self {
		self.port = Some(port);
		self
	}
}

/// Fork manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkSettings {
	/// The first port scanned when a fork does not request one.
	pub base_port: u16,
	/// The host forks bind to.
	pub host: String,
	/// Readiness polling.
	pub readiness: ReadinessConfig,
}

impl From<&SandboxConfig> for ForkSettings {
	fn from(config: &SandboxConfig) -> Self {
		Self {
			base_port: config.base_port,
			host: config.node.host.clone(),
			readiness: config.readiness.clone(),
		}
	}
}

/// The outcome of [`ForkManager::kill_all`].
#[derive(Debug, Default)]
pub struct KillReport {
	/// Forks that were killed.
	pub killed: Vec<String>,
	/// Forks that could not be killed. They remain registered.
	pub failures: Vec<KillFailure>,
}

impl KillReport {
	/// Whether every fork was killed.
	pub fn is_complete(&self) -> bool {
		self.failures.is_empty()
	}
}

/// A fork that could not be killed.
#[derive(Debug)]
pub struct KillFailure {
	/// The fork id.
	pub id: String,
	/// Why the kill failed.
	pub error: ForkError,
}

#[derive(Debug)]
struct Slot {
	fork: Fork,
	process: Box<dyn NodeProcess>,
}

#[derive(Debug, Default)]
struct Registry {
	ready: HashMap<String, Slot>,
	// Ports of forks that are still spawning. May contain duplicates when callers race for
	// the same explicit port.
	reserved: Vec<u16>,
}

impl Registry {
	fn in_use(&self, port: u16) -> bool {
		self.reserved.contains(&port) || self.ready.values().any(|s| s.fork.port == port)
	}

	// Whether anyone besides the caller's own reservation holds `port`.
	fn held_by_other(&self, port: u16) -> bool {
		self.reserved.iter().filter(|p| **p == port).count() > 1 ||
			self.ready.values().any(|s| s.fork.port == port)
	}
}

fn exited(port: u16, exit: NodeExit) -> ForkError {
	log::warn!("Node on port {port} exited ({}): {}", exit.status, exit.stderr);
	if exit.is_bind_failure() {
		ForkError::PortInUse { port }
	} else {
		ForkError::ProcessExited { port, status: exit.status, stderr: exit.stderr }
	}
}

async fn discard(port: u16, process: &mut dyn NodeProcess) {
	if let Err(e) = process.kill().await {
		log::warn!("Failed to kill node on port {port}: {e}");
	}
}

/// Releases a spawning fork's port reservation when dropped.
struct Reservation<'a> {
	registry: &'a Mutex<Registry>,
	port: u16,
}

impl Drop for Reservation<'_> {
	fn drop(&mut self) {
		let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(index) = registry.reserved.iter().position(|p| *p == self.port) {
			registry.reserved.swap_remove(index);
		}
	}
}

/// Owns every fork spawned by this process.
///
/// # Example
///
/// ```ignore
/// use forkbox::{ForkConfig, ForkManager, SandboxConfig, SupportedNetworks};
///
/// let forks = ForkManager::from_config(&SandboxConfig::default());
/// let fork = forks
///     .fork(ForkConfig::new(SupportedNetworks::Mainnet.config()).at_block(19_000_000))
///     .await?;
/// let env = forks.export_env(&fork.id)?;
/// forks.kill(&fork.id).await?;
/// ```
#[derive(Debug)]
pub struct ForkManager {
	rpc: RpcClient,
	launcher: Arc<dyn NodeLauncher>,
	settings: ForkSettings,
	registry: Mutex<Registry>,
	events: EventBus,
}

impl ForkManager {
	/// Creates a manager that launches nodes through `launcher`.
	pub fn new(rpc: RpcClient, launcher: Arc<dyn NodeLauncher>, settings: ForkSettings) -> Self {
		Self {
			rpc,
			launcher,
			settings,
			registry: Mutex::new(Registry::default()),
			events: EventBus::default(),
		}
	}

	/// Creates a manager that launches the configured node binary.
	pub fn from_config(config: &SandboxConfig) -> Self {
		Self::new(
			RpcClient::new(config.rpc_timeout()),
			Arc::new(AnvilLauncher::from(&config.node)),
			ForkSettings::from(config),
		)
	}

	fn registry(&self) -> MutexGuard<'_, Registry> {
		self.registry.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Spawns a node for `config` and waits until it answers.
	pub async fn fork(&self, config: ForkConfig) -> Result<Fork, ForkError> {
		let (reservation, contested) = self.reserve(config.port)?;
		let port = reservation.port;
		let host = self.settings.host.clone();
		let rpc_url = format!("http://{host}:{port}");
		log::info!(
			"Forking {} at {} on port {port}",
			config.network.name,
			config.block_number.map_or("latest".to_string(), |b| b.to_string())
		);

		let spec = LaunchSpec {
			network: config.network.clone(),
			block_number: config.block_number,
			host,
			port,
		};
		let mut process = self.launcher.launch(&spec).await?;

		let readiness = &self.settings.readiness;
		let ready = tokio::select! {
			biased;
			exit = process.exited() => Err(exit),
			ready = self.rpc.wait_until_ready(&rpc_url, readiness.max_attempts, readiness.interval()) => Ok(ready),
		};
		match ready {
			Ok(Ok(())) if contested => self.settle_contested(port, process.as_mut()).await?,
			Ok(Ok(())) => {
				// Something else answered on the port.
				if let Ok(exit) = tokio::time::timeout(readiness.settle(), process.exited()).await {
					return Err(exited(port, exit));
				}
			},
			Ok(Err(_)) => {
				log::warn!("Node on port {port} did not become ready, killing it");
				discard(port, process.as_mut()).await;
				return Err(ForkError::StartupTimeout { port, attempts: readiness.max_attempts });
			},
			Err(exit) => return Err(exited(port, exit)),
		}

		let fork = Fork {
			id: Uuid::new_v4().to_string(),
			network: config.network,
			rpc_url,
			port,
			pid: process.pid(),
			block_number: config.block_number,
		};
		let rejected = {
			let mut registry = self.registry();
			if registry.ready.values().any(|s| s.fork.port == port) {
				Some(process)
			} else {
				registry.ready.insert(fork.id.clone(), Slot { fork: fork.clone(), process });
				None
			}
		};
		drop(reservation);
		if let Some(mut process) = rejected {
			log::warn!("Port {port} was claimed by another fork while this one started");
			discard(port, process.as_mut()).await;
			return Err(ForkError::PortInUse { port });
		}

		log::info!("Fork {} ready at {} (pid {})", fork.id, fork.rpc_url, fork.pid);
		self.events.publish(ForkEvent::Created(fork.clone()));
		Ok(fork)
	}

	/// Reserves a port. The flag tells whether another fork already held an explicitly
	/// requested port.
	fn reserve(&self, requested: Option<u16>) -> Result<(Reservation<'_>, bool), ForkError> {
		let mut registry = self.registry();
		let (port, contested) = match requested {
			Some(port) => (port, registry.in_use(port)),
			None => (
				(self.settings.base_port..=u16::MAX)
					.find(|port| !registry.in_use(*port) && self.bindable(*port))
					.ok_or(ForkError::NoFreePort { base: self.settings.base_port })?,
				false,
			),
		};
		registry.reserved.push(port);
		Ok((Reservation { registry: &self.registry, port }, contested))
	}

	// The readiness answer on a contested port may have come from the other fork. The node
	// only keeps the port if it survives the readiness window and the other fork let go.
	async fn settle_contested(
		&self,
		port: u16,
		process: &mut dyn NodeProcess,
	) -> Result<(), ForkError> {
		let readiness = &self.settings.readiness;
		let window = readiness.interval() * readiness.max_attempts;
		if let Ok(exit) = tokio::time::timeout(window, process.exited()).await {
			return Err(exited(port, exit));
		}
		let held = self.registry().held_by_other(port);
		if held {
			log::warn!("Node on port {port} is running but another fork holds the port, killing it");
			discard(port, process).await;
			return Err(ForkError::PortInUse { port });
		}
		Ok(())
	}

	fn bindable(&self, port: u16) -> bool {
		TcpListener::bind((self.settings.host.as_str(), port)).is_ok()
	}

	/// All ready forks, ordered by port.
	pub fn list(&self) -> Vec<Fork> {
		let mut forks: Vec<_> = self.registry().ready.values().map(|s| s.fork.clone()).collect();
		forks.sort_by_key(|f| f.port);
		forks
	}

	/// The fork with `id`, if it is ready.
	pub fn get(&self, id: &str) -> Option<Fork> {
		self.registry().ready.get(id).map(|s| s.fork.clone())
	}

	/// Terminates the fork's node and forgets it.
	///
	/// If the node cannot be stopped the fork stays registered so the kill can be retried.
	pub async fn kill(&self, id: &str) -> Result<(), ForkError> {
		let Slot { fork, mut process } = self
			.registry()
			.ready
			.remove(id)
			.ok_or_else(|| ForkError::NotFound { id: id.to_string() })?;

		match process.kill().await {
			Ok(()) => {
				log::info!("Killed fork {} on port {}", fork.id, fork.port);
				self.events.publish(ForkEvent::Killed { id: fork.id, port: fork.port });
				Ok(())
			},
			Err(e) => {
				log::warn!("Failed to kill fork {}: {e}", fork.id);
				let error = ForkError::Kill { id: fork.id.clone(), message: e.to_string() };
				self.registry().ready.insert(fork.id.clone(), Slot { fork, process });
				Err(error)
			},
		}
	}

	/// Kills every fork, continuing past failures.
	pub async fn kill_all(&self) -> KillReport {
		let ids: Vec<String> = self.registry().ready.keys().cloned().collect();
		let results = join_all(ids.iter().map(|id| self.kill(id))).await;

		let mut report = KillReport::default();
		for (id, result) in ids.into_iter().zip(results) {
			match result {
				Ok(()) => report.killed.push(id),
				// Killed concurrently.
				Err(ForkError::NotFound { .. }) => {},
				Err(error) => report.failures.push(KillFailure { id, error }),
			}
		}
		report
	}

	/// The environment a process needs to run against the fork.
	///
	/// Returns `RPC_URL`, `CHAIN_ID`, `FORK_BLOCK` (`latest` when unpinned) and `FORK_ID`.
	pub fn export_env(&self, id: &str) -> Result<BTreeMap<String, String>, ForkError> {
		let fork = self.get(id).ok_or_else(|| ForkError::NotFound { id: id.to_string() })?;
		Ok(BTreeMap::from([
			(export::RPC_URL.to_string(), fork.rpc_url),
			(export::CHAIN_ID.to_string(), fork.network.chain_id.to_string()),
			(
				export::FORK_BLOCK.to_string(),
				fork.block_number.map_or(export::LATEST.to_string(), |b| b.to_string()),
			),
			(export::FORK_ID.to_string(), fork.id),
		]))
	}

	/// Receives every event of `kind` published from now on.
	pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<ForkEvent> {
		self.events.subscribe(kind)
	}

	/// The RPC client used for readiness checks.
	pub fn rpc(&self) -> &RpcClient {
		&self.rpc
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{test_fork_manager, unused_port};

	fn network() -> NetworkConfig {
		NetworkConfig::new("mainnet", 1, "https://ethereum-rpc.publicnode.com")
	}

	#[test]
	fn fork_config_builders() {
		let config = ForkConfig::new(network()).at_block(100).on_port(9000);
		assert_eq!(config.block_number, Some(100));
		assert_eq!(config.port, Some(9000));
	}

	#[tokio::test]
	async fn fork_on_explicit_port() -> anyhow::Result<()> {
		let port = unused_port()?;
		let (forks, launcher) = test_fork_manager(port);
		let fork = forks.fork(ForkConfig::new(network()).on_port(port).at_block(42)).await?;
		assert_eq!(fork.port, port);
		assert_eq!(fork.rpc_url, format!("http://127.0.0.1:{port}"));
		assert_eq!(forks.get(&fork.id), Some(fork.clone()));
		assert_eq!(launcher.launches()[0].block_number, Some(42));
		Ok(())
	}

	#[tokio::test]
	async fn fork_picks_lowest_free_port() -> anyhow::Result<()> {
		let base = unused_port()?;
		let (forks, _) = test_fork_manager(base);
		let first = forks.fork(ForkConfig::new(network())).await?;
		let second = forks.fork(ForkConfig::new(network())).await?;
		assert_eq!(first.port, base);
		assert!(second.port > first.port);
		assert_eq!(forks.list().iter().map(|f| f.port).collect::<Vec<_>>(), vec![
			first.port,
			second.port
		]);

		// A released port is reused.
		forks.kill(&first.id).await?;
		let third = forks.fork(ForkConfig::new(network())).await?;
		assert_eq!(third.port, base);
		Ok(())
	}

	#[tokio::test]
	async fn fork_fails_when_node_exits() -> anyhow::Result<()> {
		let port = unused_port()?;
		let (forks, launcher) = test_fork_manager(port);
		launcher.exit_on_start(port, "Error: failed to get fork block");
		let err = forks.fork(ForkConfig::new(network()).on_port(port)).await.unwrap_err();
		assert!(matches!(err, ForkError::ProcessExited { port: p, .. } if p == port));
		assert!(forks.list().is_empty());
		Ok(())
	}

	#[tokio::test]
	async fn fork_fails_when_node_never_answers() -> anyhow::Result<()> {
		let port = unused_port()?;
		let (forks, launcher) = test_fork_manager(port);
		launcher.never_ready_on(port);
		let err = forks.fork(ForkConfig::new(network()).on_port(port)).await.unwrap_err();
		assert!(matches!(err, ForkError::StartupTimeout { attempts: 3, .. }));
		assert!(launcher.was_killed(port));
		Ok(())
	}

	#[tokio::test]
	async fn failed_kill_keeps_fork_registered() -> anyhow::Result<()> {
		let port = unused_port()?;
		let (forks, launcher) = test_fork_manager(port);
		let fork = forks.fork(ForkConfig::new(network())).await?;
		launcher.fail_kill_on(fork.port);

		let err = forks.kill(&fork.id).await.unwrap_err();
		assert!(matches!(err, ForkError::Kill { ref id, .. } if *id == fork.id));
		assert_eq!(forks.get(&fork.id), Some(fork.clone()));

		launcher.allow_kill_on(fork.port);
		forks.kill(&fork.id).await?;
		assert!(forks.get(&fork.id).is_none());
		Ok(())
	}

	#[tokio::test]
	async fn kill_all_reports_failures() -> anyhow::Result<()> {
		let base = unused_port()?;
		let (forks, launcher) = test_fork_manager(base);
		let a = forks.fork(ForkConfig::new(network())).await?;
		let b = forks.fork(ForkConfig::new(network())).await?;
		launcher.fail_kill_on(b.port);

		let report = forks.kill_all().await;
		assert_eq!(report.killed, vec![a.id]);
		assert_eq!(report.failures.len(), 1);
		assert_eq!(report.failures[0].id, b.id);
		assert!(!report.is_complete());
		assert_eq!(forks.list(), vec![b]);
		Ok(())
	}

	#[tokio::test]
	async fn export_env_for_unpinned_fork() -> anyhow::Result<()> {
		let (forks, _) = test_fork_manager(unused_port()?);
		let fork = forks.fork(ForkConfig::new(network())).await?;
		let env = forks.export_env(&fork.id)?;
		assert_eq!(env["FORK_BLOCK"], "latest");
		assert_eq!(env["CHAIN_ID"], "1");
		assert_eq!(env["RPC_URL"], fork.rpc_url);
		assert!(matches!(forks.export_env("missing"), Err(ForkError::NotFound { .. })));
		Ok(())
	}

	#[tokio::test]
	async fn events_are_published() -> anyhow::Result<()> {
		let (forks, _) = test_fork_manager(unused_port()?);
		let mut created = forks.subscribe(EventKind::Created);
		let mut killed = forks.subscribe(EventKind::Killed);

		let fork = forks.fork(ForkConfig::new(network())).await?;
		assert_eq!(created.recv().await?, ForkEvent::Created(fork.clone()));
		forks.kill(&fork.id).await?;
		assert_eq!(killed.recv().await?, ForkEvent::Killed { id: fork.id, port: fork.port });
		Ok(())
	}

	#[test]
	fn settings_from_config() {
		let config = SandboxConfig { base_port: 9000, ..Default::default() };
		let settings = ForkSettings::from(&config);
		assert_eq!(settings.base_port, 9000);
		assert_eq!(settings.host, "127.0.0.1");
	}
}
