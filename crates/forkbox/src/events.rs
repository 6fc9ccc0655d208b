// SPDX-License-Identifier: GPL-3.0

//! Fork lifecycle notifications.

use crate::fork::Fork;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging.
const CHANNEL_CAPACITY: usize = 64;

/// The kinds of event a subscriber can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum EventKind {
	/// A fork became ready.
	#[strum(serialize = "fork:created")]
	Created,
	/// A fork was killed.
	#[strum(serialize = "fork:killed")]
	Killed,
}

/// A fork lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum ForkEvent {
	/// A fork became ready.
	Created(Fork),
	/// A fork was killed.
	Killed {
		/// The fork id.
		id: String,
		/// The port that was released.
		port: u16,
	},
}

impl ForkEvent {
	/// The kind of this event.
	pub fn kind(&self) -> EventKind {
		match self {
			ForkEvent::Created(_) => EventKind::Created,
			ForkEvent::Killed { .. } => EventKind::Killed,
		}
	}
}

/// One broadcast channel per event kind. Each subscriber receives its own copy of every
/// event published after it subscribed.
#[derive(Debug)]
pub(crate) struct EventBus {
	created: broadcast::Sender<ForkEvent>,
	killed: broadcast::Sender<ForkEvent>,
}

impl Default for EventBus {
	fn default() -> Self {
		Self {
			created: broadcast::channel(CHANNEL_CAPACITY).0,
			killed: broadcast::channel(CHANNEL_CAPACITY).0,
		}
	}
}

impl EventBus {
	fn sender(&self, kind: EventKind) -> &broadcast::Sender<ForkEvent> {
		match kind {
			EventKind::Created => &self.created,
			EventKind::Killed => &self.killed,
		}
	}

	pub(crate) fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<ForkEvent> {
		self.sender(kind).subscribe()
	}

	pub(crate) fn publish(&self, event: ForkEvent) {
		let kind = event.kind();
		// No subscribers is not an error.
		if self.sender(kind).send(event).is_err() {
			log::trace!("No subscribers for {kind}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn event_kind_names() {
		assert_eq!(EventKind::Created.to_string(), "fork:created");
		assert_eq!(EventKind::from_str("fork:killed"), Ok(EventKind::Killed));
	}

	#[tokio::test]
	async fn subscribers_only_receive_their_kind() -> anyhow::Result<()> {
		let bus = EventBus::default();
		let mut created = bus.subscribe(EventKind::Created);
		let mut killed = bus.subscribe(EventKind::Killed);
		let mut killed_too = bus.subscribe(EventKind::Killed);

		bus.publish(ForkEvent::Killed { id: "a".into(), port: 8545 });

		let expected = ForkEvent::Killed { id: "a".into(), port: 8545 };
		assert_eq!(killed.recv().await?, expected);
		assert_eq!(killed_too.recv().await?, expected);
		assert!(created.try_recv().is_err());
		Ok(())
	}

	#[test]
	fn publish_without_subscribers_is_silent() {
		EventBus::default().publish(ForkEvent::Killed { id: "a".into(), port: 1 });
	}
}
