// SPDX-License-Identifier: GPL-3.0

//! Signals for node processes this process did not spawn.
//!
//! Forks recorded by an earlier run are only known by pid. These helpers probe and stop them
//! without a child handle.

use nix::{
	errno::Errno,
	sys::signal::{Signal, kill},
	unistd::Pid,
};

fn pid(raw: u32) -> Option<Pid> {
	i32::try_from(raw).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Whether a process with `pid` exists.
///
/// A process owned by another user still counts as alive.
pub fn is_alive(raw: u32) -> bool {
	let Some(pid) = pid(raw) else {
		return false;
	};
	match kill(pid, None) {
		Ok(()) | Err(Errno::EPERM) => true,
		Err(_) => false,
	}
}

/// Sends SIGTERM to `pid`.
///
/// Returns `false` if the process had already exited.
pub fn terminate(raw: u32) -> Result<bool, Errno> {
	let Some(pid) = pid(raw) else {
		return Ok(false);
	};
	match kill(pid, Signal::SIGTERM) {
		Ok(()) => Ok(true),
		Err(Errno::ESRCH) => Ok(false),
		Err(e) => Err(e),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::process::Command;

	#[test]
	fn current_process_is_alive() {
		assert!(is_alive(std::process::id()));
	}

	#[test]
	fn invalid_pids_are_not_alive() {
		assert!(!is_alive(0));
		assert!(!is_alive(u32::MAX));
		assert_eq!(terminate(0), Ok(false));
	}

	#[test]
	fn terminate_stops_a_process() -> anyhow::Result<()> {
		let mut child = Command::new("sleep").arg("30").spawn()?;
		let id = child.id();
		assert!(is_alive(id));
		assert_eq!(terminate(id), Ok(true));
		child.wait()?;
		assert!(!is_alive(id));
		assert_eq!(terminate(id), Ok(false));
		Ok(())
	}
}
