// SPDX-License-Identifier: GPL-3.0

//! Dependency-ordered tasks and their statuses.
//!
//! The graph only orders work and tracks status; running a task is up to the caller, which
//! reports progress through [`TaskGraph::mark_status`]. Edges point from a task to the tasks it
//! depends on. Every mutation is validated before it is applied, so a rejected call leaves the
//! graph unchanged.

use crate::error::GraphError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strum_macros::{Display, EnumString};

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
	/// Prepares state, e.g. funds accounts.
	Setup,
	/// Sends a transaction.
	Transaction,
	/// Reads state.
	Query,
	/// Checks an expectation.
	Assertion,
	/// Cleans up.
	Teardown,
}

/// Where a task is in its lifecycle.
///
/// `Ready` is derived from the statuses of a pending task's dependencies and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
	/// Waiting to run.
	Pending,
	/// Pending with every dependency succeeded.
	Ready,
	/// Started and not yet finished.
	Running,
	/// Finished successfully.
	Succeeded,
	/// Finished with an error. Can be retried.
	Failed,
	/// Will not run.
	Skipped,
}

impl TaskStatus {
	/// Whether the task will not change status without an explicit retry.
	pub fn is_terminal(&self) -> bool {
		matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped)
	}

	fn can_become(&self, next: TaskStatus) -> bool {
		use TaskStatus::*;
		matches!(
			(self, next),
			(Pending, Running) |
				(Running, Succeeded) |
				(Running, Failed) |
				(Pending, Skipped) |
				(Failed, Pending)
		)
	}
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
	/// Unique id within the graph.
	pub id: String,
	/// What the task does.
	pub kind: TaskKind,
	/// The stored status. Never [`TaskStatus::Ready`].
	pub status: TaskStatus,
	/// Ids of the tasks this one depends on.
	pub depends_on: Vec<String>,
}

/// A task in a [`TaskGraphData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskData {
	/// The task id.
	pub id: String,
	/// What the task does.
	pub kind: TaskKind,
	/// The stored status.
	pub status: TaskStatus,
}

/// An edge in a [`TaskGraphData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
	/// The dependent task.
	pub task: String,
	/// The task it depends on.
	pub depends_on: String,
}

/// Serializable form of a [`TaskGraph`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraphData {
	/// Every task, in insertion order.
	pub tasks: Vec<TaskData>,
	/// Every dependency edge.
	pub edges: Vec<Edge>,
}

/// A directed acyclic graph of tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskGraph {
	tasks: IndexMap<String, Task>,
}

impl TaskGraph {
	/// An empty graph.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a pending task that depends on `depends_on`.
	pub fn add_task(
		&mut self,
		id: impl Into<String>,
		kind: TaskKind,
		depends_on: &[&str],
	) -> Result<(), GraphError> {
		let id = id.into();
		if self.tasks.contains_key(&id) {
			return Err(GraphError::DuplicateTask { id });
		}
		let mut deps: Vec<String> = Vec::with_capacity(depends_on.len());
		for dep in depends_on {
			if *dep == id {
				return Err(GraphError::Cycle { task: id.clone(), dependency: id });
			}
			if !self.tasks.contains_key(*dep) {
				return Err(GraphError::UnknownTask { id: dep.to_string() });
			}
			if !deps.iter().any(|d| d == dep) {
				deps.push(dep.to_string());
			}
		}
		self.tasks
			.insert(id.clone(), Task { id, kind, status: TaskStatus::Pending, depends_on: deps });
		Ok(())
	}

	/// Makes `task` depend on `dependency`. Both must exist.
	pub fn add_dependency(&mut self, task: &str, dependency: &str) -> Result<(), GraphError> {
		for id in [task, dependency] {
			if !self.tasks.contains_key(id) {
				return Err(GraphError::UnknownTask { id: id.to_string() });
			}
		}
		if task == dependency || self.reaches(dependency, task) {
			return Err(GraphError::Cycle {
				task: task.to_string(),
				dependency: dependency.to_string(),
			});
		}
		if let Some(entry) = self.tasks.get_mut(task) &&
			!entry.depends_on.iter().any(|d| d == dependency)
		{
			entry.depends_on.push(dependency.to_string());
		}
		Ok(())
	}

	// Whether `to` is reachable from `from` by following dependency edges.
	fn reaches(&self, from: &str, to: &str) -> bool {
		let mut stack = vec![from];
		let mut visited = HashSet::new();
		while let Some(current) = stack.pop() {
			if current == to {
				return true;
			}
			if !visited.insert(current) {
				continue;
			}
			if let Some(task) = self.tasks.get(current) {
				stack.extend(task.depends_on.iter().map(String::as_str));
			}
		}
		false
	}

	/// Moves a task to `status`.
	///
	/// Allowed transitions are `pending -> running`, `running -> succeeded`,
	/// `running -> failed`, `pending -> skipped` and `failed -> pending` (retry).
	pub fn mark_status(&mut self, id: &str, status: TaskStatus) -> Result<(), GraphError> {
		let task = self
			.tasks
			.get_mut(id)
			.ok_or_else(|| GraphError::UnknownTask { id: id.to_string() })?;
		if !task.status.can_become(status) {
			return Err(GraphError::InvalidTransition { id: id.to_string(), from: task.status, to: status });
		}
		log::debug!("Task {id}: {} -> {status}", task.status);
		task.status = status;
		Ok(())
	}

	fn is_ready(&self, task: &Task) -> bool {
		task.status == TaskStatus::Pending &&
			task.depends_on.iter().all(|dep| {
				self.tasks.get(dep).is_some_and(|d| d.status == TaskStatus::Succeeded)
			})
	}

	/// The effective status of a task, reporting `Ready` for runnable pending tasks.
	pub fn status(&self, id: &str) -> Option<TaskStatus> {
		self.tasks.get(id).map(|task| {
			if self.is_ready(task) { TaskStatus::Ready } else { task.status }
		})
	}

	/// Pending tasks whose dependencies have all succeeded, in insertion order.
	///
	/// Computed from the current statuses each time it is called.
	pub fn ready_tasks(&self) -> impl Iterator<Item = &str> + '_ {
		self.tasks.values().filter(|t| self.is_ready(t)).map(|t| t.id.as_str())
	}

	/// Whether every task has succeeded, failed or been skipped.
	pub fn is_complete(&self) -> bool {
		self.tasks.values().all(|t| t.status.is_terminal())
	}

	/// Skips every pending task that depends, directly or transitively, on a failed or
	/// skipped task. Returns the ids of the newly skipped tasks.
	pub fn skip_blocked(&mut self) -> Vec<String> {
		let mut skipped = Vec::new();
		loop {
			let blocked: Vec<String> = self
				.tasks
				.values()
				.filter(|t| t.status == TaskStatus::Pending)
				.filter(|t| {
					t.depends_on.iter().any(|dep| {
						self.tasks.get(dep).is_some_and(|d| {
							matches!(d.status, TaskStatus::Failed | TaskStatus::Skipped)
						})
					})
				})
				.map(|t| t.id.clone())
				.collect();
			if blocked.is_empty() {
				return skipped;
			}
			for id in blocked {
				if let Some(task) = self.tasks.get_mut(&id) {
					task.status = TaskStatus::Skipped;
				}
				skipped.push(id);
			}
		}
	}

	/// Tasks that depend directly on `id`.
	pub fn dependents(&self, id: &str) -> Vec<&str> {
		self.tasks
			.values()
			.filter(|t| t.depends_on.iter().any(|d| d == id))
			.map(|t| t.id.as_str())
			.collect()
	}

	/// The task with `id`.
	pub fn get(&self, id: &str) -> Option<&Task> {
		self.tasks.get(id)
	}

	/// Every task, in insertion order.
	pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
		self.tasks.values()
	}

	/// Number of tasks.
	pub fn len(&self) -> usize {
		self.tasks.len()
	}

	/// Whether the graph has no tasks.
	pub fn is_empty(&self) -> bool {
		self.tasks.is_empty()
	}

	/// The graph as tasks plus edges.
	pub fn to_data(&self) -> TaskGraphData {
		TaskGraphData {
			tasks: self
				.tasks
				.values()
				.map(|t| TaskData { id: t.id.clone(), kind: t.kind, status: t.status })
				.collect(),
			edges: self
				.tasks
				.values()
				.flat_map(|t| {
					t.depends_on
						.iter()
						.map(|d| Edge { task: t.id.clone(), depends_on: d.clone() })
				})
				.collect(),
		}
	}

	/// Rebuilds a graph, validating ids and acyclicity.
	pub fn from_data(data: TaskGraphData) -> Result<Self, GraphError> {
		let mut graph = Self::new();
		for task in &data.tasks {
			graph.add_task(task.id.clone(), task.kind, &[])?;
		}
		for edge in &data.edges {
			graph.add_dependency(&edge.task, &edge.depends_on)?;
		}
		for task in data.tasks {
			if let Some(entry) = graph.tasks.get_mut(&task.id) {
				entry.status = match task.status {
					TaskStatus::Ready => TaskStatus::Pending,
					status => status,
				};
			}
		}
		Ok(graph)
	}
}
