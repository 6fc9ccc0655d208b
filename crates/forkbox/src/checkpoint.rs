// SPDX-License-Identifier: GPL-3.0

//! Named rollback points.
//!
//! A checkpoint wraps a snapshot with a name, an optional stage and restore bookkeeping.
//! Restoring reverts the fork to the wrapped snapshot. The node consumes a snapshot when
//! reverting to it, and also drops every snapshot taken after it, so a successful restore:
//!
//! 1. takes a fresh snapshot and stores it as the checkpoint's new `snapshot_id`, so the
//!    checkpoint can be restored again;
//! 2. marks checkpoints on the same fork whose snapshots were dropped as stale.
//!
//! Restoring a stale checkpoint fails with [`CheckpointError::Stale`] without calling the
//! node. Callers take a new checkpoint instead of retrying.

use crate::{
	error::{CheckpointError, RpcClientError},
	rpc::{RpcClient, parse_quantity},
	snapshot::{SnapshotConfig, SnapshotManager, SnapshotMetadata},
	store::{Loaded, SessionStore},
	strings::rpc::methods,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// What to checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
	/// The fork being captured.
	pub fork_id: String,
	/// The owning session.
	pub session_id: String,
	/// The task the checkpoint belongs to.
	pub task_id: String,
	/// Name used to look the checkpoint up.
	pub name: String,
	/// Optional stage within the task, e.g. `pre-swap`.
	pub stage: Option<String>,
	/// Free-form description.
	pub description: String,
}

/// A recorded checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
	/// Generated id.
	pub id: String,
	/// Name used to look the checkpoint up.
	pub name: String,
	/// Optional stage within the task.
	pub stage: Option<String>,
	/// The node snapshot currently backing the checkpoint.
	pub snapshot_id: String,
	/// The fork the checkpoint was taken on.
	pub fork_id: String,
	/// The owning session.
	pub session_id: String,
	/// The task the checkpoint belongs to.
	pub task_id: String,
	/// Block height at capture time.
	pub block_number: u64,
	/// Free-form description.
	pub description: String,
	/// When the checkpoint was taken.
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	/// When the checkpoint was last restored.
	#[serde(default, with = "time::serde::rfc3339::option")]
	pub restored_at: Option<OffsetDateTime>,
	/// How many times the checkpoint was restored.
	#[serde(default)]
	pub restore_count: u32,
	/// Whether the node no longer holds the backing snapshot.
	#[serde(default)]
	pub stale: bool,
}

impl CheckpointMetadata {
	// Whether reverting to `restored` dropped this checkpoint's snapshot.
	fn dropped_by(&self, restored: &CheckpointMetadata, created_after: bool) -> bool {
		if self.fork_id != restored.fork_id || self.stale {
			return false;
		}
		match (parse_quantity(&self.snapshot_id), parse_quantity(&restored.snapshot_id)) {
			(Some(own), Some(reverted)) => own >= reverted,
			_ => created_after,
		}
	}
}

/// The checkpoint index of one session.
#[derive(Debug)]
pub struct CheckpointManager {
	session_id: String,
	rpc: RpcClient,
	store: Arc<SessionStore>,
	checkpoints: Vec<CheckpointMetadata>,
}

impl CheckpointManager {
	/// Loads the checkpoint index of `session_id`, creating an empty record if there is none.
	pub async fn init(
		session_id: impl Into<String>,
		rpc: RpcClient,
		store: Arc<SessionStore>,
	) -> Result<Self, CheckpointError> {
		let session_id = session_id.into();
		let checkpoints = match store.load(&session_id).await? {
			Loaded::Found(record) => record.checkpoints,
			Loaded::Absent | Loaded::Corrupt { .. } => {
				store.update(&session_id, |record| record.checkpoints.clear()).await?;
				Vec::new()
			},
		};
		Ok(Self::from_records(session_id, rpc, store, checkpoints))
	}

	/// A manager over an index that has already been loaded.
	pub(crate) fn from_records(
		session_id: String,
		rpc: RpcClient,
		store: Arc<SessionStore>,
		checkpoints: Vec<CheckpointMetadata>,
	) -> Self {
		Self { session_id, rpc, store, checkpoints }
	}

	/// Takes a snapshot through `snapshots` and wraps it in a checkpoint.
	pub async fn create(
		&mut self,
		snapshots: &mut SnapshotManager,
		config: CheckpointConfig,
		rpc_url: &str,
	) -> Result<CheckpointMetadata, CheckpointError> {
		self.check_session(&config.session_id)?;
		let snapshot = snapshots
			.create(
				SnapshotConfig {
					fork_id: config.fork_id,
					session_id: config.session_id,
					task_id: config.task_id,
					description: config.description,
				},
				rpc_url,
			)
			.await?;
		self.wrap(&snapshot, config.name, config.stage).await
	}

	/// Wraps an existing snapshot in a checkpoint.
	pub async fn wrap(
		&mut self,
		snapshot: &SnapshotMetadata,
		name: impl Into<String>,
		stage: Option<String>,
	) -> Result<CheckpointMetadata, CheckpointError> {
		self.check_session(&snapshot.session_id)?;
		let checkpoint = CheckpointMetadata {
			id: Uuid::new_v4().to_string(),
			name: name.into(),
			stage,
			snapshot_id: snapshot.id.clone(),
			fork_id: snapshot.fork_id.clone(),
			session_id: snapshot.session_id.clone(),
			task_id: snapshot.task_id.clone(),
			block_number: snapshot.block_number,
			description: snapshot.description.clone(),
			created_at: OffsetDateTime::now_utc(),
			restored_at: None,
			restore_count: 0,
			stale: false,
		};
		let mut checkpoints = self.checkpoints.clone();
		checkpoints.push(checkpoint.clone());
		self.persist(checkpoints).await?;
		log::info!(
			"Checkpoint `{}` ({}) on fork {} at block {}",
			checkpoint.name,
			checkpoint.id,
			checkpoint.fork_id,
			checkpoint.block_number
		);
		Ok(checkpoint)
	}

	fn check_session(&self, session_id: &str) -> Result<(), CheckpointError> {
		if session_id != self.session_id {
			return Err(CheckpointError::SessionMismatch {
				expected: self.session_id.clone(),
				actual: session_id.to_string(),
			});
		}
		Ok(())
	}

	async fn persist(&mut self, checkpoints: Vec<CheckpointMetadata>) -> Result<(), CheckpointError> {
		let persisted = checkpoints.clone();
		self.store.update(&self.session_id, |record| record.checkpoints = persisted).await?;
		self.checkpoints = checkpoints;
		Ok(())
	}

	/// The checkpoint with `id`.
	pub fn get(&self, id: &str) -> Option<&CheckpointMetadata> {
		self.checkpoints.iter().find(|c| c.id == id)
	}

	/// The most recent checkpoint named `name`.
	pub fn get_by_name(&self, name: &str) -> Option<&CheckpointMetadata> {
		self.checkpoints.iter().rev().find(|c| c.name == name)
	}

	/// The checkpoints of `task_id`, in creation order.
	pub fn for_task(&self, task_id: &str) -> Vec<&CheckpointMetadata> {
		self.checkpoints.iter().filter(|c| c.task_id == task_id).collect()
	}

	/// Every checkpoint of the session, in creation order.
	pub fn list(&self) -> &[CheckpointMetadata] {
		&self.checkpoints
	}

	/// Number of recorded checkpoints.
	pub fn count(&self) -> usize {
		self.checkpoints.len()
	}

	/// Reverts the fork at `rpc_url` to checkpoint `id` and returns the updated checkpoint.
	pub async fn restore(
		&mut self,
		id: &str,
		rpc_url: &str,
	) -> Result<CheckpointMetadata, CheckpointError> {
		let index = self
			.checkpoints
			.iter()
			.position(|c| c.id == id)
			.ok_or_else(|| CheckpointError::NotFound { id: id.to_string() })?;
		let checkpoint = self.checkpoints[index].clone();
		if checkpoint.stale {
			return Err(CheckpointError::Stale { id: checkpoint.id, snapshot_id: checkpoint.snapshot_id });
		}

		let rpc_error = |operation| {
			let checkpoint_id = checkpoint.id.clone();
			move |source: RpcClientError| CheckpointError::Rpc { operation, checkpoint_id, source }
		};
		let reverted = self
			.rpc
			.call(rpc_url, methods::EVM_REVERT, json!([checkpoint.snapshot_id]), self.rpc.timeout())
			.await
			.map_err(rpc_error("restore"))?;
		match reverted {
			Value::Bool(true) => {},
			Value::Bool(false) => {
				log::warn!(
					"Checkpoint {} is stale: node no longer holds snapshot {}",
					checkpoint.id,
					checkpoint.snapshot_id
				);
				let mut checkpoints = self.checkpoints.clone();
				checkpoints[index].stale = true;
				if let Err(e) = self.persist(checkpoints).await {
					log::warn!("Failed to record stale checkpoint {}: {e}", checkpoint.id);
				}
				return Err(CheckpointError::Stale {
					id: checkpoint.id,
					snapshot_id: checkpoint.snapshot_id,
				});
			},
			other => {
				return Err(CheckpointError::InvalidResponse {
					checkpoint_id: checkpoint.id,
					message: format!("expected a boolean from {}, got {other}", methods::EVM_REVERT),
				});
			},
		}

		// The revert consumed the snapshot. Take a new one so the checkpoint stays restorable.
		let snapshot_id: String = self
			.rpc
			.request(rpc_url, methods::EVM_SNAPSHOT, json!([]))
			.await
			.map_err(rpc_error("re-arm"))?;

		let mut checkpoints = self.checkpoints.clone();
		let mut dropped = Vec::new();
		for (i, other) in checkpoints.iter_mut().enumerate() {
			if i != index && other.dropped_by(&checkpoint, i > index) {
				other.stale = true;
				dropped.push(other.id.clone());
			}
		}
		let restored = &mut checkpoints[index];
		restored.snapshot_id = snapshot_id;
		restored.restored_at = Some(OffsetDateTime::now_utc());
		restored.restore_count += 1;
		let restored = restored.clone();
		self.persist(checkpoints).await?;

		log::info!(
			"Restored checkpoint `{}` ({}) on fork {}, {} later checkpoint(s) now stale",
			restored.name,
			restored.id,
			restored.fork_id,
			dropped.len()
		);
		Ok(restored)
	}

	/// Removes every record.
	pub async fn reset(&mut self) -> Result<(), CheckpointError> {
		self.persist(Vec::new()).await
	}

	/// Drops the in-memory index, leaving the persisted record untouched.
	pub(crate) fn discard(&mut self) {
		self.checkpoints.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		error::ErrorClass,
		testing::{MockNode, unused_port},
	};
	use std::time::Duration;
	use tempfile::{TempDir, tempdir};

	struct Fixture {
		_dir: TempDir,
		node: MockNode,
		snapshots: SnapshotManager,
		checkpoints: CheckpointManager,
	}

	async fn fixture() -> anyhow::Result<Fixture> {
		let dir = tempdir()?;
		let store = Arc::new(SessionStore::new(dir.path()));
		let rpc = RpcClient::new(Duration::from_secs(2));
		let node = MockNode::start(unused_port()?, 1, 100).await?;
		let snapshots = SnapshotManager::init("s1", rpc.clone(), store.clone()).await?;
		let checkpoints = CheckpointManager::init("s1", rpc, store).await?;
		Ok(Fixture { _dir: dir, node, snapshots, checkpoints })
	}

	fn config(name: &str) -> CheckpointConfig {
		CheckpointConfig {
			fork_id: "fork-1".to_string(),
			session_id: "s1".to_string(),
			task_id: "t1".to_string(),
			name: name.to_string(),
			stage: Some("pre".to_string()),
			description: format!("before {name}"),
		}
	}

	#[tokio::test]
	async fn create_wraps_a_new_snapshot() -> anyhow::Result<()> {
		let Fixture { _dir, node, mut snapshots, mut checkpoints } = fixture().await?;
		let checkpoint = checkpoints.create(&mut snapshots, config("swap"), &node.url()).await?;

		assert_eq!(checkpoint.snapshot_id, "0x1");
		assert_eq!(checkpoint.stage.as_deref(), Some("pre"));
		assert_eq!(snapshots.count(), 1);
		assert_eq!(checkpoints.get(&checkpoint.id), Some(&checkpoint));
		assert_eq!(checkpoints.get_by_name("swap"), Some(&checkpoint));
		assert_eq!(checkpoints.for_task("t1"), vec![&checkpoint]);
		Ok(())
	}

	#[tokio::test]
	async fn restore_reverts_and_rearms() -> anyhow::Result<()> {
		let Fixture { _dir, node, mut snapshots, mut checkpoints } = fixture().await?;
		let checkpoint = checkpoints.create(&mut snapshots, config("swap"), &node.url()).await?;
		node.chain().mine(3);

		let restored = checkpoints.restore(&checkpoint.id, &node.url()).await?;
		assert_eq!(node.chain().block_number(), 100);
		assert_eq!(restored.restore_count, 1);
		assert!(restored.restored_at.is_some());
		assert_ne!(restored.snapshot_id, checkpoint.snapshot_id);

		// Restorable again after more changes.
		node.chain().mine(2);
		let again = checkpoints.restore(&checkpoint.id, &node.url()).await?;
		assert_eq!(again.restore_count, 2);
		assert_eq!(node.chain().block_number(), 100);
		Ok(())
	}

	#[tokio::test]
	async fn restore_marks_later_checkpoints_stale() -> anyhow::Result<()> {
		let Fixture { _dir, node, mut snapshots, mut checkpoints } = fixture().await?;
		let early = checkpoints.create(&mut snapshots, config("early"), &node.url()).await?;
		node.chain().mine(1);
		let late = checkpoints.create(&mut snapshots, config("late"), &node.url()).await?;

		checkpoints.restore(&early.id, &node.url()).await?;
		assert!(checkpoints.get(&late.id).is_some_and(|c| c.stale));

		let err = checkpoints.restore(&late.id, &node.url()).await.unwrap_err();
		assert!(err.is_stale());
		assert_eq!(err.class(), ErrorClass::Stale);
		Ok(())
	}

	#[tokio::test]
	async fn restore_of_pruned_snapshot_is_stale() -> anyhow::Result<()> {
		let Fixture { _dir, node, mut snapshots, mut checkpoints } = fixture().await?;
		let checkpoint = checkpoints.create(&mut snapshots, config("swap"), &node.url()).await?;
		node.chain().forget_snapshots();

		let err = checkpoints.restore(&checkpoint.id, &node.url()).await.unwrap_err();
		assert!(matches!(err, CheckpointError::Stale { ref snapshot_id, .. } if snapshot_id == "0x1"));
		assert!(checkpoints.get(&checkpoint.id).is_some_and(|c| c.stale));
		Ok(())
	}

	#[tokio::test]
	async fn restore_against_dead_endpoint_fails() -> anyhow::Result<()> {
		let Fixture { _dir, node, mut snapshots, mut checkpoints } = fixture().await?;
		let checkpoint = checkpoints.create(&mut snapshots, config("swap"), &node.url()).await?;
		let url = node.url();
		node.stop().await;

		let err = checkpoints.restore(&checkpoint.id, &url).await.unwrap_err();
		assert!(matches!(err, CheckpointError::Rpc { operation: "restore", .. }));
		assert_eq!(err.class(), ErrorClass::Transport);
		assert_eq!(checkpoints.get(&checkpoint.id).map(|c| c.restore_count), Some(0));
		Ok(())
	}

	#[tokio::test]
	async fn restore_unknown_checkpoint_fails() -> anyhow::Result<()> {
		let Fixture { _dir, node, mut checkpoints, .. } = fixture().await?;
		let err = checkpoints.restore("missing", &node.url()).await.unwrap_err();
		assert!(matches!(err, CheckpointError::NotFound { .. }));
		Ok(())
	}

	#[tokio::test]
	async fn wrap_rejects_foreign_snapshots() -> anyhow::Result<()> {
		let Fixture { _dir, mut checkpoints, .. } = fixture().await?;
		let snapshot = SnapshotMetadata {
			id: "0x1".to_string(),
			fork_id: "fork-1".to_string(),
			session_id: "other".to_string(),
			task_id: "t1".to_string(),
			block_number: 1,
			description: String::new(),
			timestamp: OffsetDateTime::now_utc(),
		};
		let err = checkpoints.wrap(&snapshot, "x", None).await.unwrap_err();
		assert!(matches!(err, CheckpointError::SessionMismatch { .. }));
		Ok(())
	}

	#[tokio::test]
	async fn checkpoints_survive_reload() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let store = Arc::new(SessionStore::new(dir.path()));
		let rpc = RpcClient::new(Duration::from_secs(2));
		let node = MockNode::start(unused_port()?, 1, 100).await?;
		let mut snapshots = SnapshotManager::init("s1", rpc.clone(), store.clone()).await?;
		let mut checkpoints = CheckpointManager::init("s1", rpc.clone(), store.clone()).await?;
		let checkpoint = checkpoints.create(&mut snapshots, config("swap"), &node.url()).await?;

		let reloaded = CheckpointManager::init("s1", rpc, store).await?;
		assert_eq!(reloaded.list(), &[checkpoint]);
		Ok(())
	}
}
