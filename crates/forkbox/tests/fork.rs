// SPDX-License-Identifier: GPL-3.0

//! Fork lifecycle tests against in-process mock nodes.

use anyhow::Result;
use forkbox::{
	ErrorClass, ForkConfig, NetworkConfig, RpcClient, SessionStore, SnapshotConfig,
	SnapshotManager, SupportedNetworks,
	error::ForkError,
	testing::{test_fork_manager, unused_port},
};
use std::{sync::Arc, time::Duration};
use tempfile::tempdir;

fn mainnet() -> NetworkConfig {
	SupportedNetworks::Mainnet.config()
}

#[tokio::test]
async fn fork_snapshot_then_kill() -> Result<()> {
	let dir = tempdir()?;
	let (forks, launcher) = test_fork_manager(unused_port()?);
	let fork = forks.fork(ForkConfig::new(mainnet()).at_block(19_000_000)).await?;
	assert_eq!(fork.block_number, Some(19_000_000));
	assert_eq!(forks.rpc().block_number(&fork.rpc_url).await?, 19_000_000);
	assert_eq!(forks.rpc().chain_id(&fork.rpc_url).await?, 1);

	let store = Arc::new(SessionStore::new(dir.path()));
	let mut snapshots =
		SnapshotManager::init("s1", RpcClient::new(Duration::from_secs(2)), store).await?;
	let snapshot = snapshots
		.create(
			SnapshotConfig {
				fork_id: fork.id.clone(),
				session_id: "s1".to_string(),
				task_id: "deploy".to_string(),
				description: "before deploy".to_string(),
			},
			&fork.rpc_url,
		)
		.await?;
	assert_eq!(snapshot.block_number, 19_000_000);
	assert_eq!(launcher.chain(fork.port).map(|c| c.snapshot_ids()), Some(vec![snapshot.id]));

	forks.kill(&fork.id).await?;
	assert!(launcher.was_killed(fork.port));
	assert!(forks.list().is_empty());
	// Killing a fork leaves its recorded snapshots alone.
	assert_eq!(snapshots.count(), 1);
	Ok(())
}

#[tokio::test]
async fn concurrent_forks_on_the_same_port_collide() -> Result<()> {
	let port = unused_port()?;
	let (forks, _) = test_fork_manager(port);

	let (a, b) = tokio::join!(
		forks.fork(ForkConfig::new(mainnet()).on_port(port)),
		forks.fork(ForkConfig::new(mainnet()).on_port(port)),
	);
	let (winner, err) = match (a, b) {
		(Ok(fork), Err(err)) | (Err(err), Ok(fork)) => (fork, err),
		(a, b) => anyhow::bail!("expected exactly one fork to win, got {a:?} and {b:?}"),
	};
	assert!(matches!(err, ForkError::PortInUse { port: p } if p == port));
	assert_eq!(err.class(), ErrorClass::Conflict);
	assert_eq!(forks.list(), vec![winner]);
	Ok(())
}

#[tokio::test]
async fn late_bind_failure_on_a_held_port_is_rejected() -> Result<()> {
	let port = unused_port()?;
	let (forks, launcher) = test_fork_manager(port);
	let first = forks.fork(ForkConfig::new(mainnet()).on_port(port)).await?;
	// The second node only reports its bind failure well after the settle window, while the
	// first fork keeps answering readiness checks on the port.
	launcher.late_bind_failure_on(port, Duration::from_millis(300));

	let err = forks.fork(ForkConfig::new(mainnet()).on_port(port)).await.unwrap_err();
	assert!(matches!(err, ForkError::PortInUse { port: p } if p == port));
	assert_eq!(err.class(), ErrorClass::Conflict);
	assert_eq!(forks.list(), vec![first.clone()]);
	assert_eq!(forks.rpc().chain_id(&first.rpc_url).await?, 1);
	Ok(())
}

#[tokio::test]
async fn concurrent_automatic_forks_get_distinct_ports() -> Result<()> {
	let (forks, launcher) = test_fork_manager(unused_port()?);
	let (a, b, c) = tokio::join!(
		forks.fork(ForkConfig::new(mainnet())),
		forks.fork(ForkConfig::new(mainnet())),
		forks.fork(ForkConfig::new(mainnet())),
	);
	let mut ports = vec![a?.port, b?.port, c?.port];
	ports.sort();
	ports.dedup();
	assert_eq!(ports.len(), 3);
	assert_eq!(launcher.launches().len(), 3);
	assert!(forks.kill_all().await.is_complete());
	assert!(forks.list().is_empty());
	Ok(())
}

#[tokio::test]
async fn killing_twice_is_not_found() -> Result<()> {
	let (forks, _) = test_fork_manager(unused_port()?);
	let fork = forks.fork(ForkConfig::new(mainnet())).await?;
	forks.kill(&fork.id).await?;
	let err = forks.kill(&fork.id).await.unwrap_err();
	assert!(matches!(err, ForkError::NotFound { ref id } if *id == fork.id));
	assert_eq!(err.class(), ErrorClass::NotFound);
	Ok(())
}

#[tokio::test]
async fn export_env_describes_the_fork() -> Result<()> {
	let (forks, _) = test_fork_manager(unused_port()?);
	let base = SupportedNetworks::Base.config();
	let fork = forks.fork(ForkConfig::new(base).at_block(12_345)).await?;
	let env = forks.export_env(&fork.id)?;
	assert_eq!(env["CHAIN_ID"], "8453");
	assert_eq!(env["FORK_ID"], fork.id);
	assert_eq!(env["FORK_BLOCK"], "12345");
	assert_eq!(env["RPC_URL"], fork.rpc_url);
	Ok(())
}
