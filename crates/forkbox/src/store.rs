// SPDX-License-Identifier: GPL-3.0

//! Persisted session records.
//!
//! Each session is stored as `<root>/<session_id>.json`, a pretty-printed [`SessionRecord`].
//! Records are written to a temporary file and renamed into place, so a reader never sees a
//! half-written record. Writes are serialized through one lock per store.

use crate::{
	checkpoint::CheckpointMetadata,
	config::SandboxConfig,
	error::StoreError,
	session::SessionMetadata,
	snapshot::SnapshotMetadata,
	strings::store::{CORRUPT_SUFFIX, RECORD_EXTENSION, TMP_SUFFIX},
};
use serde::{Deserialize, Serialize};
use std::{
	io::ErrorKind,
	path::{Path, PathBuf},
};
use tokio::{fs, sync::Mutex};

/// Everything persisted for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
	/// The session and its forks.
	pub session: SessionMetadata,
	/// The snapshot index, in creation order.
	#[serde(default)]
	pub snapshots: Vec<SnapshotMetadata>,
	/// The checkpoint index, in creation order.
	#[serde(default)]
	pub checkpoints: Vec<CheckpointMetadata>,
}

impl SessionRecord {
	/// A record with no snapshots or checkpoints.
	pub fn new(session: SessionMetadata) -> Self {
		Self { session, snapshots: Vec::new(), checkpoints: Vec::new() }
	}
}

/// The result of reading a persisted record.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
	/// The record was read.
	Found(T),
	/// There is no record. Treat as fresh.
	Absent,
	/// The record exists but cannot be decoded.
	Corrupt {
		/// The unreadable file.
		path: PathBuf,
		/// Why it could not be decoded.
		reason: String,
	},
}

impl<T> Loaded<T> {
	/// The record, if it was read.
	pub fn found(self) -> Option<T> {
		match self {
			Loaded::Found(value) => Some(value),
			Loaded::Absent | Loaded::Corrupt { .. } => None,
		}
	}
}

/// Reads and writes session records under one directory.
#[derive(Debug)]
pub struct SessionStore {
	root: PathBuf,
	write_lock: Mutex<()>,
}

impl SessionStore {
	/// A store rooted at `root`. The directory is created on first write.
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into(), write_lock: Mutex::new(()) }
	}

	/// A store in the configured sessions directory.
	pub fn from_config(config: &SandboxConfig) -> Self {
		Self::new(config.sessions_dir())
	}

	/// The directory holding the records.
	pub fn root(&self) -> &Path {
		&self.root
	}

	/// The file holding the record of session `id`.
	pub fn path(&self, id: &str) -> Result<PathBuf, StoreError> {
		let valid = !id.is_empty() &&
			id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
		if !valid {
			return Err(StoreError::InvalidId { id: id.to_string() });
		}
		Ok(self.root.join(format!("{id}.{RECORD_EXTENSION}")))
	}

	/// Reads the record of session `id`.
	pub async fn load(&self, id: &str) -> Result<Loaded<SessionRecord>, StoreError> {
		let path = self.path(id)?;
		let contents = match fs::read_to_string(&path).await {
			Ok(contents) => contents,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::Absent),
			Err(source) => return Err(StoreError::Io { operation: "read", path, source }),
		};
		Ok(match serde_json::from_str(&contents) {
			Ok(record) => Loaded::Found(record),
			Err(e) => Loaded::Corrupt { path, reason: e.to_string() },
		})
	}

	/// Writes `record`, replacing any previous record of the session.
	pub async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().await;
		self.write(record).await
	}

	/// Applies `change` to the record of session `id` and writes it back.
	///
	/// A missing record starts out empty. A corrupt record is moved aside first and then
	/// treated as missing.
	pub async fn update<R>(
		&self,
		id: &str,
		change: impl FnOnce(&mut SessionRecord) -> R,
	) -> Result<R, StoreError> {
		let _guard = self.write_lock.lock().await;
		let mut record = match self.load(id).await? {
			Loaded::Found(record) => record,
			Loaded::Absent => SessionRecord::new(SessionMetadata::new(id)),
			Loaded::Corrupt { path, reason } => {
				let aside = path.with_extension(format!("{RECORD_EXTENSION}.{CORRUPT_SUFFIX}"));
				log::warn!(
					"Session record {} is corrupt ({reason}), moving it to {}",
					path.display(),
					aside.display()
				);
				fs::rename(&path, &aside)
					.await
					.map_err(|source| StoreError::Io { operation: "move aside", path, source })?;
				SessionRecord::new(SessionMetadata::new(id))
			},
		};
		let result = change(&mut record);
		self.write(&record).await?;
		Ok(result)
	}

	/// Deletes the record of session `id`. Returns `false` if there was none.
	pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
		let path = self.path(id)?;
		let _guard = self.write_lock.lock().await;
		match fs::remove_file(&path).await {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
			Err(source) => Err(StoreError::Io { operation: "remove", path, source }),
		}
	}

	/// Reads every record in the store, ordered by session id.
	pub async fn load_all(&self) -> Result<Vec<(String, Loaded<SessionRecord>)>, StoreError> {
		let mut entries = match fs::read_dir(&self.root).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
			Err(source) =>
				return Err(StoreError::Io { operation: "list", path: self.root.clone(), source }),
		};
		let mut ids = Vec::new();
		loop {
			let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
				operation: "list",
				path: self.root.clone(),
				source,
			})?;
			let Some(entry) = entry else { break };
			let path = entry.path();
			if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) &&
				let Some(id) = path.file_stem().and_then(|s| s.to_str())
			{
				ids.push(id.to_string());
			}
		}
		ids.sort();

		let mut records = Vec::with_capacity(ids.len());
		for id in ids {
			match self.load(&id).await {
				Ok(loaded) => records.push((id, loaded)),
				Err(StoreError::InvalidId { id }) => {
					log::warn!("Ignoring session record with invalid id `{id}`");
				},
				Err(e) => return Err(e),
			}
		}
		Ok(records)
	}

	async fn write(&self, record: &SessionRecord) -> Result<(), StoreError> {
		let id = &record.session.id;
		let path = self.path(id)?;
		fs::create_dir_all(&self.root).await.map_err(|source| StoreError::Io {
			operation: "create",
			path: self.root.clone(),
			source,
		})?;
		let contents = serde_json::to_vec_pretty(record)
			.map_err(|source| StoreError::Encode { session_id: id.clone(), source })?;
		let tmp = path.with_extension(format!("{RECORD_EXTENSION}.{TMP_SUFFIX}"));
		fs::write(&tmp, contents)
			.await
			.map_err(|source| StoreError::Io { operation: "write", path: tmp.clone(), source })?;
		fs::rename(&tmp, &path)
			.await
			.map_err(|source| StoreError::Io { operation: "replace", path, source })?;
		log::debug!("Saved session record {id}");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[tokio::test]
	async fn load_absent_record() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let store = SessionStore::new(dir.path().join("sessions"));
		assert_eq!(store.load("s1").await?, Loaded::Absent);
		assert!(store.load_all().await?.is_empty());
		assert!(!store.remove("s1").await?);
		Ok(())
	}

	#[tokio::test]
	async fn save_then_load() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let store = SessionStore::new(dir.path());
		let record = SessionRecord::new(SessionMetadata::new("s1"));
		store.save(&record).await?;

		assert_eq!(store.load("s1").await?, Loaded::Found(record));
		assert!(dir.path().join("s1.json").exists());
		assert!(!dir.path().join("s1.json.tmp").exists());
		Ok(())
	}

	#[tokio::test]
	async fn update_creates_missing_record() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let store = SessionStore::new(dir.path());
		let count = store
			.update("s1", |record| {
				record.session.forks.clear();
				record.snapshots.len()
			})
			.await?;
		assert_eq!(count, 0);
		assert!(matches!(store.load("s1").await?, Loaded::Found(r) if r.session.id == "s1"));
		Ok(())
	}

	#[tokio::test]
	async fn corrupt_records_are_reported_and_moved_aside_on_update() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let store = SessionStore::new(dir.path());
		std::fs::write(dir.path().join("broken.json"), "{ not json")?;
		store.save(&SessionRecord::new(SessionMetadata::new("fine"))).await?;

		let all = store.load_all().await?;
		assert_eq!(all.len(), 2);
		assert!(matches!(&all[0], (id, Loaded::Corrupt { .. }) if id == "broken"));
		assert!(matches!(&all[1], (id, Loaded::Found(_)) if id == "fine"));

		store.update("broken", |_| ()).await?;
		assert!(dir.path().join("broken.json.corrupt").exists());
		assert!(matches!(store.load("broken").await?, Loaded::Found(_)));
		Ok(())
	}

	#[tokio::test]
	async fn invalid_ids_are_rejected() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let store = SessionStore::new(dir.path());
		for id in ["", "../escape", "a/b", "with space"] {
			assert!(matches!(store.load(id).await, Err(StoreError::InvalidId { .. })));
		}
		Ok(())
	}

	#[tokio::test]
	async fn remove_deletes_record() -> anyhow::Result<()> {
		let dir = tempdir()?;
		let store = SessionStore::new(dir.path());
		store.save(&SessionRecord::new(SessionMetadata::new("s1"))).await?;
		assert!(store.remove("s1").await?);
		assert_eq!(store.load("s1").await?, Loaded::Absent);
		Ok(())
	}
}
