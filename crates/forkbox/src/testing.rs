// SPDX-License-Identifier: GPL-3.0

//! Test utilities: an in-process mock node and a launcher that starts it.
//!
//! [`MockNode`] is a JSON-RPC server implementing the handful of methods forks are driven
//! through. [`MockLauncher`] starts one per fork on the requested port, so port collisions
//! surface exactly as they would with a real node: the second bind fails and the "process"
//! exits with an address-in-use error.

use crate::{
	config::ReadinessConfig,
	error::ForkError,
	fork::{ForkManager, ForkSettings, LaunchSpec, NodeExit, NodeLauncher, NodeProcess},
	rpc::{RpcClient, Sleeper, parse_quantity},
	session::SessionManager,
	store::SessionStore,
	strings::rpc::methods,
};
use async_trait::async_trait;
use jsonrpsee::{
	RpcModule,
	server::{ServerBuilder, ServerHandle},
	types::ErrorObjectOwned,
};
use std::{
	collections::{HashMap, HashSet},
	io,
	net::TcpListener,
	path::Path,
	process::Stdio,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};
use tokio::{
	process::{Child, Command},
	time::Instant,
};

/// Initializes `env_logger` for tests. Safe to call repeatedly.
pub fn init_logger() {
	let _ = env_logger::builder().is_test(true).try_init();
}

/// A port that was free a moment ago.
pub fn unused_port() -> io::Result<u16> {
	Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ChainState {
	chain_id: u64,
	block_number: u64,
	next_snapshot: u64,
	// Snapshot id and the block it captured, oldest first.
	snapshots: Vec<(u64, u64)>,
}

/// Handle to the state of a [`MockNode`].
#[derive(Debug, Clone)]
pub struct MockChain {
	state: Arc<Mutex<ChainState>>,
}

impl MockChain {
	fn new(chain_id: u64, block_number: u64) -> Self {
		let state = ChainState { chain_id, block_number, next_snapshot: 1, snapshots: Vec::new() };
		Self { state: Arc::new(Mutex::new(state)) }
	}

	/// The current block height.
	pub fn block_number(&self) -> u64 {
		lock(&self.state).block_number
	}

	/// Advances the chain by `blocks`.
	pub fn mine(&self, blocks: u64) {
		lock(&self.state).block_number += blocks;
	}

	/// Ids of the snapshots the node still holds.
	pub fn snapshot_ids(&self) -> Vec<String> {
		lock(&self.state).snapshots.iter().map(|(id, _)| format!("{id:#x}")).collect()
	}

	/// Drops every snapshot, as a node restart would.
	pub fn forget_snapshots(&self) {
		lock(&self.state).snapshots.clear();
	}

	fn snapshot(&self) -> String {
		let mut state = lock(&self.state);
		let id = state.next_snapshot;
		state.next_snapshot += 1;
		let block = state.block_number;
		state.snapshots.push((id, block));
		format!("{id:#x}")
	}

	// Reverting consumes the snapshot and every later one.
	fn revert(&self, id: u64) -> bool {
		let mut state = lock(&self.state);
		let Some(index) = state.snapshots.iter().position(|(s, _)| *s == id) else {
			return false;
		};
		state.block_number = state.snapshots[index].1;
		state.snapshots.truncate(index);
		true
	}
}

/// An in-process JSON-RPC node.
#[derive(Debug)]
pub struct MockNode {
	port: u16,
	chain: MockChain,
	handle: ServerHandle,
}

impl MockNode {
	/// Serves a chain with `chain_id` at `block_number` on `port`.
	pub async fn start(port: u16, chain_id: u64, block_number: u64) -> io::Result<Self> {
		let server = ServerBuilder::default().build(format!("127.0.0.1:{port}")).await?;
		let port = server.local_addr()?.port();
		let chain = MockChain::new(chain_id, block_number);

		let mut module = RpcModule::new(());
		let state = chain.clone();
		module
			.register_method(methods::ETH_CHAIN_ID, move |_, _, _| {
				format!("{:#x}", lock(&state.state).chain_id)
			})
			.map_err(io::Error::other)?;
		let state = chain.clone();
		module
			.register_method(methods::ETH_BLOCK_NUMBER, move |_, _, _| {
				format!("{:#x}", state.block_number())
			})
			.map_err(io::Error::other)?;
		let state = chain.clone();
		module
			.register_method(methods::EVM_SNAPSHOT, move |_, _, _| state.snapshot())
			.map_err(io::Error::other)?;
		let state = chain.clone();
		module
			.register_method(methods::EVM_REVERT, move |params, _, _| {
				let id: String = params.one()?;
				let id = parse_quantity(&id).ok_or_else(|| {
					ErrorObjectOwned::owned(-32602, "invalid snapshot id", Some(id.clone()))
				})?;
				Ok::<_, ErrorObjectOwned>(state.revert(id))
			})
			.map_err(io::Error::other)?;

		let handle = server.start(module);
		Ok(Self { port, chain, handle })
	}

	/// The HTTP endpoint of the node.
	pub fn url(&self) -> String {
		format!("http://127.0.0.1:{}", self.port)
	}

	/// The port the node listens on.
	pub fn port(&self) -> u16 {
		self.port
	}

	/// The node's chain state.
	pub fn chain(&self) -> MockChain {
		self.chain.clone()
	}

	/// Stops serving and waits until the port is released.
	pub async fn stop(self) {
		if self.handle.stop().is_ok() {
			self.handle.stopped().await;
		}
	}
}

#[derive(Debug, Default)]
struct LauncherState {
	launches: Vec<LaunchSpec>,
	chains: HashMap<u16, MockChain>,
	exit_on_start: HashMap<u16, String>,
	never_ready: HashSet<u16>,
	late_bind_failure: HashMap<u16, Duration>,
	fail_kill: HashSet<u16>,
	killed: Vec<u16>,
}

/// A [`NodeLauncher`] that serves each fork from a [`MockNode`].
///
/// Each mock process is backed by a real, idle child process so that pids behave like a
/// node's: they are alive until killed.
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
	state: Arc<Mutex<LauncherState>>,
}

impl MockLauncher {
	/// Every launch so far, in order.
	pub fn launches(&self) -> Vec<LaunchSpec> {
		lock(&self.state).launches.clone()
	}

	/// The chain served on `port`.
	pub fn chain(&self, port: u16) -> Option<MockChain> {
		lock(&self.state).chains.get(&port).cloned()
	}

	/// Makes the next node on `port` exit immediately, writing `stderr`.
	pub fn exit_on_start(&self, port: u16, stderr: &str) {
		lock(&self.state).exit_on_start.insert(port, stderr.to_string());
	}

	/// Makes nodes on `port` start but never answer.
	pub fn never_ready_on(&self, port: u16) {
		lock(&self.state).never_ready.insert(port);
	}

	/// Makes a node that cannot bind `port` report the failure only after `delay`, like a
	/// node that fetches its fork block before binding.
	pub fn late_bind_failure_on(&self, port: u16, delay: Duration) {
		lock(&self.state).late_bind_failure.insert(port, delay);
	}

	/// Makes killing the node on `port` fail.
	pub fn fail_kill_on(&self, port: u16) {
		lock(&self.state).fail_kill.insert(port);
	}

	/// Lets the node on `port` be killed again.
	pub fn allow_kill_on(&self, port: u16) {
		lock(&self.state).fail_kill.remove(&port);
	}

	/// Whether a node on `port` was killed.
	pub fn was_killed(&self, port: u16) -> bool {
		lock(&self.state).killed.contains(&port)
	}
}

#[async_trait]
impl NodeLauncher for MockLauncher {
	async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn NodeProcess>, ForkError> {
		let (exit, never_ready, bind_delay) = {
			let mut state = lock(&self.state);
			state.launches.push(spec.clone());
			(
				state.exit_on_start.remove(&spec.port),
				state.never_ready.contains(&spec.port),
				state.late_bind_failure.get(&spec.port).copied(),
			)
		};
		let idle = Command::new("sleep")
			.arg("3600")
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| ForkError::Spawn { port: spec.port, message: e.to_string() })?;
		let mut process = MockProcess {
			port: spec.port,
			idle,
			node: None,
			exit: None,
			exit_at: None,
			launcher: self.state.clone(),
		};

		if let Some(stderr) = exit {
			process.exit = Some(NodeExit { status: "exit status: 1".to_string(), stderr });
		} else if !never_ready {
			let block = spec.block_number.unwrap_or(20_000_000);
			match MockNode::start(spec.port, spec.network.chain_id, block).await {
				Ok(node) => {
					lock(&self.state).chains.insert(spec.port, node.chain());
					process.node = Some(node);
				},
				Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
					process.exit_at = bind_delay.map(|delay| Instant::now() + delay);
					process.exit = Some(NodeExit {
						status: "exit status: 1".to_string(),
						stderr: "Error: Address already in use (os error 98)".to_string(),
					});
				},
				Err(e) => return Err(ForkError::Spawn { port: spec.port, message: e.to_string() }),
			}
		}
		Ok(Box::new(process))
	}
}

#[derive(Debug)]
struct MockProcess {
	port: u16,
	idle: Child,
	node: Option<MockNode>,
	exit: Option<NodeExit>,
	exit_at: Option<Instant>,
	launcher: Arc<Mutex<LauncherState>>,
}

#[async_trait]
impl NodeProcess for MockProcess {
	fn pid(&self) -> u32 {
		self.idle.id().unwrap_or_default()
	}

	async fn exited(&mut self) -> NodeExit {
		let Some(exit) = self.exit.clone() else {
			return std::future::pending().await;
		};
		if let Some(at) = self.exit_at {
			tokio::time::sleep_until(at).await;
		}
		exit
	}

	async fn kill(&mut self) -> io::Result<()> {
		if lock(&self.launcher).fail_kill.contains(&self.port) {
			return Err(io::Error::new(io::ErrorKind::PermissionDenied, "operation not permitted"));
		}
		if let Some(node) = self.node.take() {
			node.stop().await;
		}
		if self.idle.try_wait()?.is_none() {
			self.idle.kill().await?;
		}
		lock(&self.launcher).killed.push(self.port);
		self.exit = Some(NodeExit { status: "signal: 9 (SIGKILL)".to_string(), stderr: String::new() });
		self.exit_at = None;
		Ok(())
	}
}

/// A [`Sleeper`] that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
	sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
	/// Every requested delay, in order.
	pub fn sleeps(&self) -> Vec<Duration> {
		lock(&self.sleeps).clone()
	}
}

#[async_trait]
impl Sleeper for RecordingSleeper {
	async fn sleep(&self, duration: Duration) {
		lock(&self.sleeps).push(duration);
		tokio::task::yield_now().await;
	}
}

/// Fork settings with fast readiness polling.
pub fn test_settings(base_port: u16) -> ForkSettings {
	ForkSettings {
		base_port,
		host: "127.0.0.1".to_string(),
		readiness: ReadinessConfig { max_attempts: 3, interval_ms: 10, settle_ms: 20 },
	}
}

/// A fork manager backed by a [`MockLauncher`].
pub fn test_fork_manager(base_port: u16) -> (ForkManager, MockLauncher) {
	init_logger();
	let launcher = MockLauncher::default();
	let forks = ForkManager::new(
		RpcClient::new(Duration::from_secs(2)),
		Arc::new(launcher.clone()),
		test_settings(base_port),
	);
	(forks, launcher)
}

/// A session manager persisting to `dir`, backed by a [`MockLauncher`].
pub fn test_session_manager(dir: &Path, base_port: u16) -> (SessionManager, MockLauncher) {
	let (forks, launcher) = test_fork_manager(base_port);
	let sessions = SessionManager::new(Arc::new(forks), Arc::new(SessionStore::new(dir)));
	(sessions, launcher)
}
