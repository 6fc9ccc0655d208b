// SPDX-License-Identifier: GPL-3.0

//! Launching node processes.

use crate::{
	config::NodeConfig,
	error::ForkError,
	network::NetworkConfig,
	strings::node::{BIND_FAILURE_PATTERNS, args},
};
use async_trait::async_trait;
use std::{
	collections::VecDeque,
	fmt::Debug,
	io,
	process::Stdio,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};
use tokio::{
	io::{AsyncBufReadExt, BufReader},
	process::{Child, Command},
	task::JoinHandle,
};

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;
/// How long to wait for the stderr reader once the process has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
	/// The upstream network to fork.
	pub network: NetworkConfig,
	/// The block to pin the fork at. `None` follows the upstream head.
	pub block_number: Option<u64>,
	/// The host to bind.
	pub host: String,
	/// The port to bind.
	pub port: u16,
}

/// How a node process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeExit {
	/// The exit status, as reported by the OS.
	pub status: String,
	/// The last lines the process wrote to stderr.
	pub stderr: String,
}

impl NodeExit {
	/// Whether the node exited because it could not bind its port.
	pub fn is_bind_failure(&self) -> bool {
		let stderr = self.stderr.to_lowercase();
		BIND_FAILURE_PATTERNS.iter().any(|p| stderr.contains(p))
	}
}

/// A running node.
#[async_trait]
pub trait NodeProcess: Debug + Send + Sync {
	/// The OS process id.
	fn pid(&self) -> u32;

	/// Resolves once the process has exited. Safe to cancel and call again.
	async fn exited(&mut self) -> NodeExit;

	/// Stops the process and waits for it. Succeeds if it had already exited.
	async fn kill(&mut self) -> io::Result<()>;
}

/// Starts node processes.
#[async_trait]
pub trait NodeLauncher: Debug + Send + Sync {
	/// Starts a node for `spec`. Returns as soon as the process exists, before it is ready.
	async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn NodeProcess>, ForkError>;
}

/// Launches `anvil` (or a compatible binary) in fork mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnvilLauncher {
	binary: String,
	extra_args: Vec<String>,
}

impl From<&NodeConfig> for AnvilLauncher {
	fn from(config: &NodeConfig) -> Self {
		Self { binary: config.binary.clone(), extra_args: config.extra_args.clone() }
	}
}

impl AnvilLauncher {
	/// Creates a launcher for `binary`.
	pub fn new(binary: impl Into<String>) -> Self {
		Self { binary: binary.into(), extra_args: Vec::new() }
	}

	/// The node's command-line arguments for `spec`.
	pub fn args(&self, spec: &LaunchSpec) -> Vec<String> {
		let mut cmd_args = vec![
			args::HOST.to_string(),
			spec.host.clone(),
			args::PORT.to_string(),
			spec.port.to_string(),
			args::FORK_URL.to_string(),
			spec.network.rpc_url.clone(),
		];
		if let Some(block) = spec.block_number {
			cmd_args.push(args::FORK_BLOCK_NUMBER.to_string());
			cmd_args.push(block.to_string());
		}
		cmd_args.extend(self.extra_args.iter().cloned());
		cmd_args
	}
}

#[async_trait]
impl NodeLauncher for AnvilLauncher {
	async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn NodeProcess>, ForkError> {
		let spawn_error = |message: String| ForkError::Spawn { port: spec.port, message };
		let child = Command::new(&self.binary)
			.args(self.args(spec))
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| spawn_error(format!("{}: {e}", self.binary)))?;
		let process = AnvilProcess::new(child, spec.port)
			.ok_or_else(|| spawn_error("process exited immediately".into()))?;
		log::debug!("Spawned {} (pid {}) on port {}", self.binary, process.pid, spec.port);
		Ok(Box::new(process))
	}
}

/// A node spawned by [`AnvilLauncher`]. Killed when dropped.
#[derive(Debug)]
struct AnvilProcess {
	child: Child,
	pid: u32,
	tail: Arc<Mutex<VecDeque<String>>>,
	stderr_task: Option<JoinHandle<()>>,
}

impl AnvilProcess {
	/// Wraps a spawned child, collecting the tail of its stderr in the background.
	fn new(mut child: Child, port: u16) -> Option<Self> {
		let pid = child.id()?;
		let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
		let stderr_task = child.stderr.take().map(|stderr| {
			let tail = tail.clone();
			tokio::spawn(async move {
				let mut lines = BufReader::new(stderr).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					log::trace!("[node:{port}] {line}");
					let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
					if tail.len() == STDERR_TAIL_LINES {
						tail.pop_front();
					}
					tail.push_back(line);
				}
			})
		});
		Some(Self { child, pid, tail, stderr_task })
	}

	fn stderr(&self) -> String {
		let tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
		tail.iter().cloned().collect::<Vec<_>>().join("\n")
	}
}

#[async_trait]
impl NodeProcess for AnvilProcess {
	fn pid(&self) -> u32 {
		self.pid
	}

	async fn exited(&mut self) -> NodeExit {
		let status = match self.child.wait().await {
			Ok(status) => status.to_string(),
			Err(e) => format!("unknown ({e})"),
		};
		if let Some(task) = self.stderr_task.as_mut() {
			let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
			self.stderr_task = None;
		}
		NodeExit { status, stderr: self.stderr() }
	}

	async fn kill(&mut self) -> io::Result<()> {
		if self.child.try_wait()?.is_some() {
			return Ok(());
		}
		self.child.kill().await
	}
}
