// SPDX-License-Identifier: GPL-3.0

//! Point-in-time captures of fork state.
//!
//! A [`SnapshotManager`] is scoped to one session. It keeps the session's snapshot index in
//! memory, in creation order, and mirrors it into the session record. Only
//! [`SnapshotManager::create`] talks to a node; lookups are synchronous.

use crate::{
	error::SnapshotError,
	rpc::RpcClient,
	store::{Loaded, SessionStore},
	strings::rpc::methods,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;

/// What to snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
	/// The fork being captured.
	pub fork_id: String,
	/// The owning session.
	pub session_id: String,
	/// The task the snapshot is taken for.
	pub task_id: String,
	/// Free-form description.
	pub description: String,
}

/// A recorded snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
	/// The node's snapshot handle, e.g. `0x1`.
	pub id: String,
	/// The fork the snapshot was taken on.
	pub fork_id: String,
	/// The owning session.
	pub session_id: String,
	/// The task the snapshot was taken for.
	pub task_id: String,
	/// Block height at capture time.
	pub block_number: u64,
	/// Free-form description.
	pub description: String,
	/// When the snapshot was taken.
	#[serde(with = "time::serde::rfc3339")]
	pub timestamp: OffsetDateTime,
}

/// The snapshot index of one session.
#[derive(Debug)]
pub struct SnapshotManager {
	session_id: String,
	rpc: RpcClient,
	store: Arc<SessionStore>,
	snapshots: Vec<SnapshotMetadata>,
}

impl SnapshotManager {
	/// Loads the snapshot index of `session_id`, creating an empty record if there is none.
	pub async fn init(
		session_id: impl Into<String>,
		rpc: RpcClient,
		store: Arc<SessionStore>,
	) -> Result<Self, SnapshotError> {
		let session_id = session_id.into();
		let snapshots = match store.load(&session_id).await? {
			Loaded::Found(record) => record.snapshots,
			Loaded::Absent | Loaded::Corrupt { .. } => {
				store.update(&session_id, |record| record.snapshots.clear()).await?;
				Vec::new()
			},
		};
		Ok(Self::from_records(session_id, rpc, store, snapshots))
	}

	/// A manager over an index that has already been loaded.
	pub(crate) fn from_records(
		session_id: String,
		rpc: RpcClient,
		store: Arc<SessionStore>,
		snapshots: Vec<SnapshotMetadata>,
	) -> Self {
		Self { session_id, rpc, store, snapshots }
	}

	/// The session this manager belongs to.
	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	/// Captures the state of the fork at `rpc_url` and records it.
	pub async fn create(
		&mut self,
		config: SnapshotConfig,
		rpc_url: &str,
	) -> Result<SnapshotMetadata, SnapshotError> {
		if config.session_id != self.session_id {
			return Err(SnapshotError::SessionMismatch {
				expected: self.session_id.clone(),
				actual: config.session_id,
			});
		}

		let id: String = self
			.rpc
			.request(rpc_url, methods::EVM_SNAPSHOT, json!([]))
			.await
			.map_err(|source| SnapshotError::Rpc {
				operation: "take snapshot",
				fork_id: config.fork_id.clone(),
				source,
			})?;
		if id.is_empty() {
			return Err(SnapshotError::InvalidResponse {
				fork_id: config.fork_id,
				message: "empty snapshot id".to_string(),
			});
		}
		let block_number =
			self.rpc.block_number(rpc_url).await.map_err(|source| SnapshotError::Rpc {
				operation: "read block number",
				fork_id: config.fork_id.clone(),
				source,
			})?;

		let snapshot = SnapshotMetadata {
			id,
			fork_id: config.fork_id,
			session_id: config.session_id,
			task_id: config.task_id,
			block_number,
			description: config.description,
			timestamp: OffsetDateTime::now_utc(),
		};
		let mut snapshots = self.snapshots.clone();
		snapshots.push(snapshot.clone());
		self.persist(snapshots).await?;

		log::info!(
			"Snapshot {} of fork {} at block {} for task {}",
			snapshot.id,
			snapshot.fork_id,
			snapshot.block_number,
			snapshot.task_id
		);
		Ok(snapshot)
	}

	async fn persist(&mut self, snapshots: Vec<SnapshotMetadata>) -> Result<(), SnapshotError> {
		let persisted = snapshots.clone();
		self.store.update(&self.session_id, |record| record.snapshots = persisted).await?;
		self.snapshots = snapshots;
		Ok(())
	}

	/// The snapshot with `id`, if recorded.
	///
	/// Snapshot ids are only unique per fork; the most recent match wins.
	pub fn get(&self, id: &str) -> Option<&SnapshotMetadata> {
		self.snapshots.iter().rev().find(|s| s.id == id)
	}

	/// The most recent snapshot taken for `task_id`.
	pub fn get_for_task(&self, task_id: &str) -> Option<&SnapshotMetadata> {
		self.snapshots.iter().rev().find(|s| s.task_id == task_id)
	}

	/// Every snapshot of the session, in creation order.
	pub fn list(&self) -> &[SnapshotMetadata] {
		&self.snapshots
	}

	/// Number of recorded snapshots.
	pub fn count(&self) -> usize {
		self.snapshots.len()
	}

	/// Removes the most recent record with `id`.
	pub async fn prune(&mut self, id: &str) -> Result<SnapshotMetadata, SnapshotError> {
		let index = self
			.snapshots
			.iter()
			.rposition(|s| s.id == id)
			.ok_or_else(|| SnapshotError::NotFound { id: id.to_string() })?;
		let mut snapshots = self.snapshots.clone();
		let removed = snapshots.remove(index);
		self.persist(snapshots).await?;
		Ok(removed)
	}

	/// Removes every record.
	pub async fn reset(&mut self) -> Result<(), SnapshotError> {
		self.persist(Vec::new()).await
	}

	/// Drops the in-memory index, leaving the persisted record untouched.
	pub(crate) fn discard(&mut self) {
		self.snapshots.clear();
	}
}
