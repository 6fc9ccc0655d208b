// SPDX-License-Identifier: GPL-3.0

//! Task graph error types.

use super::ErrorClass;
use crate::graph::TaskStatus;
use thiserror::Error;

/// Errors that can occur when mutating a task graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
	/// A task with this id already exists.
	#[error("Task {id} already exists")]
	DuplicateTask {
		/// The duplicated id.
		id: String,
	},
	/// The task id is not part of the graph.
	#[error("Task {id} not found")]
	UnknownTask {
		/// The unknown id.
		id: String,
	},
	/// The edge would make the graph cyclic.
	#[error("Adding dependency {task} -> {dependency} would create a cycle")]
	Cycle {
		/// The dependent task.
		task: String,
		/// The dependency that already (transitively) depends on `task`.
		dependency: String,
	},
	/// The status change is not an allowed transition.
	#[error("Task {id} cannot move from {from} to {to}")]
	InvalidTransition {
		/// The task id.
		id: String,
		/// The current status.
		from: TaskStatus,
		/// The requested status.
		to: TaskStatus,
	},
}

impl GraphError {
	/// The class of this failure.
	pub fn class(&self) -> ErrorClass {
		match self {
			GraphError::UnknownTask { .. } => ErrorClass::NotFound,
			GraphError::DuplicateTask { .. } |
			GraphError::Cycle { .. } |
			GraphError::InvalidTransition { .. } => ErrorClass::Conflict,
		}
	}
}
