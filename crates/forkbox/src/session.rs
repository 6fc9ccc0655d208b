// SPDX-License-Identifier: GPL-3.0

//! Sessions group the forks, snapshots and checkpoints of one run of work.
//!
//! A session is the unit of cleanup. [`SessionManager::destroy`] kills every fork the session
//! created, discards its indices and deletes its record. If a fork cannot be killed the record
//! is kept with only the surviving forks, so calling `destroy` again continues where the
//! previous attempt stopped.
//!
//! Records outlive the process. [`SessionManager::recover`] reads them back after a restart
//! and classifies forks this process does not own: a fork whose pid is gone is `dead`, one
//! whose pid is still running is `orphaned`. Neither is adopted or respawned.

use crate::{
	checkpoint::{CheckpointConfig, CheckpointManager, CheckpointMetadata},
	config::SandboxConfig,
	error::{CheckpointError, ForkError, SessionError, StoreError},
	fork::{Fork, ForkConfig, ForkManager, KillFailure},
	process,
	rpc::RpcClient,
	snapshot::{SnapshotConfig, SnapshotManager, SnapshotMetadata},
	store::{Loaded, SessionRecord, SessionStore},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	path::PathBuf,
	sync::{Arc, Mutex as SyncMutex, PoisonError},
};
use strum_macros::{Display, EnumString};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Whether a recorded fork is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ForkStatus {
	/// Owned by this process.
	Live,
	/// Its process is gone.
	Dead,
	/// Its process is running but belongs to an earlier run.
	Orphaned,
}

/// A fork as recorded in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFork {
	/// The fork id.
	pub id: String,
	/// The node's OS process id.
	pub pid: u32,
	/// The port the node listens on.
	pub port: u16,
	/// The local endpoint of the fork.
	pub rpc_url: String,
	/// The upstream chain id.
	pub chain_id: u64,
	/// The pinned block, if any.
	pub block_number: Option<u64>,
	/// Whether the fork is still usable.
	pub status: ForkStatus,
}

impl From<&Fork> for SessionFork {
	fn from(fork: &Fork) -> Self {
		Self {
			id: fork.id.clone(),
			pid: fork.pid,
			port: fork.port,
			rpc_url: fork.rpc_url.clone(),
			chain_id: fork.network.chain_id,
			block_number: fork.block_number,
			status: ForkStatus::Live,
		}
	}
}

/// A session and the forks created under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
	/// Generated id.
	pub id: String,
	/// When the session was created.
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	/// Every fork created under the session that has not been released.
	#[serde(default)]
	pub forks: Vec<SessionFork>,
}

impl SessionMetadata {
	/// A session without forks, created now.
	pub fn new(id: impl Into<String>) -> Self {
		Self { id: id.into(), created_at: OffsetDateTime::now_utc(), forks: Vec::new() }
	}

	/// The recorded fork with `id`.
	pub fn fork(&self, id: &str) -> Option<&SessionFork> {
		self.forks.iter().find(|f| f.id == id)
	}
}

/// The outcome of [`SessionManager::destroy`].
#[derive(Debug)]
pub struct TeardownReport {
	/// The session.
	pub session_id: String,
	/// Forks that were killed or found already gone.
	pub released: Vec<String>,
	/// Forks that could not be killed. They remain recorded.
	pub failures: Vec<KillFailure>,
	/// Whether the session record was deleted.
	pub record_removed: bool,
}

impl TeardownReport {
	/// Whether the session is fully gone.
	pub fn is_complete(&self) -> bool {
		self.failures.is_empty() && self.record_removed
	}
}

/// The outcome of [`SessionManager::recover`].
#[derive(Debug, Default)]
pub struct RecoveryReport {
	/// Sessions loaded from disk.
	pub sessions: Vec<String>,
	/// Forks whose process is gone.
	pub dead_forks: Vec<String>,
	/// Forks whose process is running but not owned by this process.
	pub orphaned_forks: Vec<String>,
	/// Records that could not be decoded. They are left in place.
	pub corrupt: Vec<PathBuf>,
}

#[derive(Debug)]
struct SessionState {
	metadata: SessionMetadata,
	snapshots: SnapshotManager,
	checkpoints: CheckpointManager,
	destroyed: bool,
}

/// Owns sessions and their lifecycles.
///
/// Operations on one session are serialized; different sessions proceed independently.
#[derive(Debug)]
pub struct SessionManager {
	forks: Arc<ForkManager>,
	rpc: RpcClient,
	store: Arc<SessionStore>,
	sessions: SyncMutex<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionManager {
	/// Creates a manager that spawns forks through `forks` and persists to `store`.
	pub fn new(forks: Arc<ForkManager>, store: Arc<SessionStore>) -> Self {
		let rpc = forks.rpc().clone();
		Self { forks, rpc, store, sessions: SyncMutex::new(HashMap::new()) }
	}

	/// Creates a manager from configuration.
	pub fn from_config(config: &SandboxConfig) -> Self {
		Self::new(
			Arc::new(ForkManager::from_config(config)),
			Arc::new(SessionStore::from_config(config)),
		)
	}

	/// The fork manager shared by every session.
	pub fn forks(&self) -> &Arc<ForkManager> {
		&self.forks
	}

	fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<SessionState>>>> {
		self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn state_from_record(&self, record: SessionRecord) -> SessionState {
		let id = record.session.id.clone();
		SessionState {
			metadata: record.session,
			snapshots: SnapshotManager::from_records(
				id.clone(),
				self.rpc.clone(),
				self.store.clone(),
				record.snapshots,
			),
			checkpoints: CheckpointManager::from_records(
				id,
				self.rpc.clone(),
				self.store.clone(),
				record.checkpoints,
			),
			destroyed: false,
		}
	}

	/// Starts a new, empty session.
	pub async fn create(&self) -> Result<SessionMetadata, SessionError> {
		let metadata = SessionMetadata::new(Uuid::new_v4().to_string());
		let record = SessionRecord::new(metadata.clone());
		self.store.save(&record).await?;
		let state = self.state_from_record(record);
		self.sessions().insert(metadata.id.clone(), Arc::new(Mutex::new(state)));
		log::info!("Created session {}", metadata.id);
		Ok(metadata)
	}

	// The session with `id`, loading its record if it is not in memory.
	async fn session(&self, id: &str) -> Result<Arc<Mutex<SessionState>>, SessionError> {
		let existing = self.sessions().get(id).cloned();
		if let Some(state) = existing {
			return Ok(state);
		}
		let not_found = || SessionError::NotFound { id: id.to_string() };
		let record = match self.store.load(id).await {
			Ok(Loaded::Found(record)) => record,
			Ok(Loaded::Absent) | Err(StoreError::InvalidId { .. }) =>
				return Err(not_found()),
			Ok(Loaded::Corrupt { path, reason }) => {
				log::warn!("Session record {} is corrupt: {reason}", path.display());
				return Err(not_found());
			},
			Err(e) => return Err(e.into()),
		};
		let state = Arc::new(Mutex::new(self.state_from_record(record)));
		Ok(self.sessions().entry(id.to_string()).or_insert(state).clone())
	}

	/// Locks the session, failing if it has been destroyed meanwhile.
	async fn lock(
		&self,
		id: &str,
	) -> Result<tokio::sync::OwnedMutexGuard<SessionState>, SessionError> {
		let state = self.session(id).await?.lock_owned().await;
		if state.destroyed {
			return Err(SessionError::NotFound { id: id.to_string() });
		}
		Ok(state)
	}

	/// The metadata of session `id`.
	pub async fn get(&self, id: &str) -> Option<SessionMetadata> {
		let state = self.lock(id).await.ok()?;
		Some(state.metadata.clone())
	}

	/// The metadata of every session in memory, ordered by creation time.
	pub async fn list(&self) -> Vec<SessionMetadata> {
		let states: Vec<_> = self.sessions().values().cloned().collect();
		let mut sessions = Vec::with_capacity(states.len());
		for state in states {
			let state = state.lock().await;
			if !state.destroyed {
				sessions.push(state.metadata.clone());
			}
		}
		sessions.sort_by_key(|s| s.created_at);
		sessions
	}

	/// Ids of every session in memory.
	pub fn ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Creates a fork under session `session_id`.
	pub async fn fork(&self, session_id: &str, config: ForkConfig) -> Result<Fork, SessionError> {
		let mut state = self.lock(session_id).await?;
		let fork = self.forks.fork(config).await?;

		let mut metadata = state.metadata.clone();
		metadata.forks.push(SessionFork::from(&fork));
		let persisted = metadata.clone();
		if let Err(e) = self.store.update(session_id, |record| record.session = persisted).await {
			// Every live fork must be recorded.
			log::warn!("Failed to record fork {} in session {session_id}: {e}", fork.id);
			if let Err(kill) = self.forks.kill(&fork.id).await {
				log::warn!("Failed to kill unrecorded fork {}: {kill}", fork.id);
			}
			return Err(e.into());
		}
		state.metadata = metadata;
		log::info!("Session {session_id} forked {} on port {}", fork.id, fork.port);
		Ok(fork)
	}

	// The live fork behind a session row.
	fn live_fork(&self, state: &SessionState, fork_id: &str) -> Result<Fork, SessionError> {
		if state.metadata.fork(fork_id).is_none() {
			return Err(SessionError::ForkNotInSession {
				session_id: state.metadata.id.clone(),
				fork_id: fork_id.to_string(),
			});
		}
		// A fork that is no longer registered may have had its port taken by another node.
		self.forks
			.get(fork_id)
			.ok_or_else(|| ForkError::NotFound { id: fork_id.to_string() }.into())
	}

	/// Snapshots fork `fork_id` of session `session_id`.
	pub async fn snapshot(
		&self,
		session_id: &str,
		fork_id: &str,
		task_id: &str,
		description: &str,
	) -> Result<SnapshotMetadata, SessionError> {
		let mut state = self.lock(session_id).await?;
		let fork = self.live_fork(&state, fork_id)?;
		let config = SnapshotConfig {
			fork_id: fork.id,
			session_id: session_id.to_string(),
			task_id: task_id.to_string(),
			description: description.to_string(),
		};
		Ok(state.snapshots.create(config, &fork.rpc_url).await?)
	}

	/// Creates a checkpoint described by `config`.
	pub async fn checkpoint(
		&self,
		config: CheckpointConfig,
	) -> Result<CheckpointMetadata, SessionError> {
		let mut state = self.lock(&config.session_id).await?;
		let fork = self.live_fork(&state, &config.fork_id)?;
		let SessionState { snapshots, checkpoints, .. } = &mut *state;
		Ok(checkpoints.create(snapshots, config, &fork.rpc_url).await?)
	}

	/// Restores checkpoint `checkpoint_id` of session `session_id`.
	pub async fn restore(
		&self,
		session_id: &str,
		checkpoint_id: &str,
	) -> Result<CheckpointMetadata, SessionError> {
		let mut state = self.lock(session_id).await?;
		let fork_id = state
			.checkpoints
			.get(checkpoint_id)
			.map(|c| c.fork_id.clone())
			.ok_or_else(|| CheckpointError::NotFound { id: checkpoint_id.to_string() })?;
		let fork = self.live_fork(&state, &fork_id)?;
		Ok(state.checkpoints.restore(checkpoint_id, &fork.rpc_url).await?)
	}

	/// The snapshots of session `session_id`, in creation order.
	pub async fn snapshots(&self, session_id: &str) -> Result<Vec<SnapshotMetadata>, SessionError> {
		Ok(self.lock(session_id).await?.snapshots.list().to_vec())
	}

	/// The checkpoints of session `session_id`, in creation order.
	pub async fn checkpoints(
		&self,
		session_id: &str,
	) -> Result<Vec<CheckpointMetadata>, SessionError> {
		Ok(self.lock(session_id).await?.checkpoints.list().to_vec())
	}

	/// Releases every fork of the session, then discards its indices and record.
	///
	/// Kill failures do not stop the teardown of the other forks. They are returned in the
	/// report, and the record is kept with only the forks that failed.
	pub async fn destroy(&self, session_id: &str) -> Result<TeardownReport, SessionError> {
		let mut state = self.lock(session_id).await?;
		let rows = state.metadata.forks.clone();
		let results = join_all(rows.iter().map(|row| self.release(row))).await;

		let mut released = Vec::new();
		let mut failures = Vec::new();
		let mut remaining = Vec::new();
		for (row, result) in rows.into_iter().zip(results) {
			match result {
				Ok(()) => released.push(row.id),
				Err(error) => {
					failures.push(KillFailure { id: row.id.clone(), error });
					remaining.push(row);
				},
			}
		}

		if !failures.is_empty() {
			log::warn!(
				"Teardown of session {session_id} incomplete: {} fork(s) could not be killed",
				failures.len()
			);
			let mut metadata = state.metadata.clone();
			metadata.forks = remaining;
			let persisted = metadata.clone();
			self.store.update(session_id, |record| record.session = persisted).await?;
			state.metadata = metadata;
			return Ok(TeardownReport {
				session_id: session_id.to_string(),
				released,
				failures,
				record_removed: false,
			});
		}

		state.metadata.forks.clear();
		state.snapshots.discard();
		state.checkpoints.discard();
		self.store.remove(session_id).await?;
		state.destroyed = true;
		self.sessions().remove(session_id);
		log::info!("Destroyed session {session_id}, released {} fork(s)", released.len());
		Ok(TeardownReport {
			session_id: session_id.to_string(),
			released,
			failures,
			record_removed: true,
		})
	}

	// Stops the process behind a session row. A process that is already gone counts as
	// released.
	async fn release(&self, row: &SessionFork) -> Result<(), ForkError> {
		if self.forks.get(&row.id).is_some() {
			return match self.forks.kill(&row.id).await {
				Ok(()) | Err(ForkError::NotFound { .. }) => Ok(()),
				Err(e) => Err(e),
			};
		}
		if row.status == ForkStatus::Dead || !process::is_alive(row.pid) {
			return Ok(());
		}
		// Only signal the pid if it still serves the recorded chain; pids get reused.
		match self.rpc.chain_id(&row.rpc_url).await {
			Ok(chain_id) if chain_id == row.chain_id => {
				log::info!("Terminating orphaned fork {} (pid {})", row.id, row.pid);
				process::terminate(row.pid)
					.map(|_| ())
					.map_err(|e| ForkError::Kill { id: row.id.clone(), message: e.to_string() })
			},
			_ => {
				log::warn!(
					"Fork {} no longer answers at {}, leaving pid {} alone",
					row.id,
					row.rpc_url,
					row.pid
				);
				Ok(())
			},
		}
	}

	/// Loads every persisted session this manager does not hold yet and classifies forks it
	/// does not own.
	pub async fn recover(&self) -> Result<RecoveryReport, SessionError> {
		let mut report = RecoveryReport::default();
		for (id, loaded) in self.store.load_all().await? {
			let mut record = match loaded {
				Loaded::Found(record) => record,
				Loaded::Absent => continue,
				Loaded::Corrupt { path, reason } => {
					log::warn!("Skipping corrupt session record {}: {reason}", path.display());
					report.corrupt.push(path);
					continue;
				},
			};
			if self.sessions().contains_key(&id) {
				continue;
			}

			let mut changed = false;
			for row in record.session.forks.iter_mut() {
				if row.status == ForkStatus::Dead || self.forks.get(&row.id).is_some() {
					continue;
				}
				let alive = process::is_alive(row.pid);
				match (row.status, alive) {
					(ForkStatus::Live, true) => {
						row.status = ForkStatus::Orphaned;
						report.orphaned_forks.push(row.id.clone());
					},
					(_, false) => {
						row.status = ForkStatus::Dead;
						report.dead_forks.push(row.id.clone());
					},
					// Still orphaned.
					_ => continue,
				}
				changed = true;
			}
			if changed {
				let session = record.session.clone();
				self.store.update(&id, |r| r.session = session).await?;
			}

			let state = Arc::new(Mutex::new(self.state_from_record(record)));
			self.sessions().entry(id.clone()).or_insert(state);
			report.sessions.push(id);
		}
		log::info!(
			"Recovered {} session(s): {} dead fork(s), {} orphaned fork(s), {} corrupt record(s)",
			report.sessions.len(),
			report.dead_forks.len(),
			report.orphaned_forks.len(),
			report.corrupt.len()
		);
		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		error::ErrorClass,
		network::NetworkConfig,
		testing::{test_session_manager, unused_port},
	};
	use tempfile::tempdir;

	fn network() -> NetworkConfig {
		NetworkConfig::new("mainnet", 1, "https://ethereum-rpc.publicnode.com")
	}

	#[tokio::test]
	async fn create_persists_an_empty_record() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let (sessions, _) = test_session_manager(dir.path(), unused_port()?);
		let session = sessions.create().await?;
		assert!(session.forks.is_empty());
		assert!(dir.path().join(format!("{}.json", session.id)).exists());
		assert_eq!(sessions.get(&session.id).await, Some(session.clone()));
		assert_eq!(sessions.ids(), vec![session.id]);
		Ok(())
	}

	#[tokio::test]
	async fn fork_snapshot_and_restore_through_session() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let (sessions, launcher) = test_session_manager(dir.path(), unused_port()?);
		let session = sessions.create().await?;
		let fork = sessions.fork(&session.id, ForkConfig::new(network()).at_block(500)).await?;

		let snapshot = sessions.snapshot(&session.id, &fork.id, "t1", "before").await?;
		assert_eq!(snapshot.block_number, 500);

		let checkpoint = sessions
			.checkpoint(CheckpointConfig {
				fork_id: fork.id.clone(),
				session_id: session.id.clone(),
				task_id: "t1".into(),
				name: "pre-swap".into(),
				stage: None,
				description: "before swap".into(),
			})
			.await?;
		launcher.chain(fork.port).expect("chain").mine(10);
		let restored = sessions.restore(&session.id, &checkpoint.id).await?;
		assert_eq!(restored.restore_count, 1);
		assert_eq!(launcher.chain(fork.port).expect("chain").block_number(), 500);

		assert_eq!(sessions.snapshots(&session.id).await?.len(), 2);
		assert_eq!(sessions.get(&session.id).await.map(|s| s.forks.len()), Some(1));
		Ok(())
	}

	#[tokio::test]
	async fn operations_on_foreign_or_dead_forks_fail() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let (sessions, _) = test_session_manager(dir.path(), unused_port()?);
		let a = sessions.create().await?;
		let b = sessions.create().await?;
		let fork = sessions.fork(&a.id, ForkConfig::new(network())).await?;

		let err = sessions.snapshot(&b.id, &fork.id, "t", "").await.unwrap_err();
		assert!(matches!(err, SessionError::ForkNotInSession { .. }));

		sessions.forks().kill(&fork.id).await?;
		let err = sessions.snapshot(&a.id, &fork.id, "t", "").await.unwrap_err();
		assert!(matches!(err, SessionError::Fork(ForkError::NotFound { .. })));
		assert_eq!(err.class(), ErrorClass::NotFound);
		Ok(())
	}

	#[tokio::test]
	async fn unknown_sessions_are_not_found() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let (sessions, _) = test_session_manager(dir.path(), unused_port()?);
		assert!(matches!(sessions.destroy("missing").await, Err(SessionError::NotFound { .. })));
		assert!(matches!(
			sessions.fork("../bad", ForkConfig::new(network())).await,
			Err(SessionError::NotFound { .. })
		));
		assert!(sessions.get("missing").await.is_none());
		Ok(())
	}

	#[tokio::test]
	async fn destroy_releases_everything() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let (sessions, _) = test_session_manager(dir.path(), unused_port()?);
		let session = sessions.create().await?;
		let fork = sessions.fork(&session.id, ForkConfig::new(network())).await?;
		sessions.snapshot(&session.id, &fork.id, "t1", "").await?;

		let report = sessions.destroy(&session.id).await?;
		assert!(report.is_complete());
		assert_eq!(report.released, vec![fork.id.clone()]);
		assert!(sessions.forks().get(&fork.id).is_none());
		assert!(!dir.path().join(format!("{}.json", session.id)).exists());
		assert!(sessions.list().await.is_empty());
		assert!(matches!(sessions.destroy(&session.id).await, Err(SessionError::NotFound { .. })));
		Ok(())
	}
}
