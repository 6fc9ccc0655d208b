// SPDX-License-Identifier: GPL-3.0

//! Disposable forks of EVM networks for automated agents.
//!
//! A fork is a local node (anvil by default) forking a live network at a given block. Forks
//! are grouped into sessions, which own the snapshots and named checkpoints taken on their
//! forks and can be torn down as a unit or recovered after a restart. A [`TaskGraph`]
//! tracks the dependency-ordered tasks an agent runs against a session.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SessionManager                           │
//! │        (session lifecycle, teardown, recovery on restart)       │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                      │                      │
//!          ▼                      ▼                      ▼
//! ┌─────────────────┐  ┌────────────────────┐  ┌────────────────────┐
//! │   ForkManager   │  │  SnapshotManager   │  │ CheckpointManager  │
//! │ (spawn, ports,  │  │  (evm_snapshot)    │─▶│ (named snapshots,  │
//! │  kill, events)  │  │                    │  │  evm_revert)       │
//! └─────────────────┘  └────────────────────┘  └────────────────────┘
//!          │                      │                      │
//!          ▼                      ▼                      ▼
//! ┌─────────────────┐  ┌──────────────────────────────────────────────┐
//! │  NodeLauncher   │  │  RpcClient (JSON-RPC over HTTP)              │
//! │  (anvil child)  │  │  SessionStore (one JSON record per session)  │
//! └─────────────────┘  └──────────────────────────────────────────────┘
//! ```

mod checkpoint;
mod config;
pub mod error;
mod events;
mod fork;
mod graph;
mod network;
mod process;
mod rpc;
mod session;
mod snapshot;
mod store;
mod strings;
/// Mocks and helpers for testing code built on this crate.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use checkpoint::{CheckpointConfig, CheckpointManager, CheckpointMetadata};
pub use config::{NodeConfig, ReadinessConfig, SandboxConfig};
pub use error::{Error, ErrorClass};
pub use events::{EventKind, ForkEvent};
pub use fork::{
	AnvilLauncher, Fork, ForkConfig, ForkManager, ForkSettings, KillFailure, KillReport,
	LaunchSpec, NodeExit, NodeLauncher, NodeProcess,
};
pub use graph::{Edge, Task, TaskData, TaskGraph, TaskGraphData, TaskKind, TaskStatus};
pub use network::{NetworkConfig, NetworkRegistry, SupportedNetworks};
pub use rpc::{RpcClient, Sleeper, TokioSleeper, parse_quantity};
pub use session::{
	ForkStatus, RecoveryReport, SessionFork, SessionManager, SessionMetadata, TeardownReport,
};
pub use snapshot::{SnapshotConfig, SnapshotManager, SnapshotMetadata};
pub use store::{Loaded, SessionRecord, SessionStore};
