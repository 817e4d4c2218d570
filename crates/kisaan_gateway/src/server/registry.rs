#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use kisaan_domain::{ConversationId, FarmerId, PrincipalKind, Room};
use kisaan_protocol::{Envelope, PresencePeer, PresenceSnapshot, ServerEvent, ServerFrame};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::server::error::GatewayError;
use crate::util::time::unix_ms_now;

/// Outbound event queue of one connection.
pub type OutboundTx = mpsc::Sender<ServerFrame>;

/// An authenticated entity on a connection.
#[derive(Debug, Clone)]
pub struct Principal {
	pub kind: PrincipalKind,
	pub principal_id: String,
	pub display_name: String,
	/// For automated agents, the farmer being served; otherwise the
	/// principal's own identity.
	pub farmer_id: FarmerId,
}

/// Configuration for the room registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub debug_logs: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self { debug_logs: false }
	}
}

/// Presence table and room memberships.
///
/// The only shared mutable state besides the upload table. The lock is held
/// for map bookkeeping only; outbound sends happen on cloned senders after
/// it is released.
pub struct RoomRegistry {
	inner: RwLock<Inner>,
	cfg: RegistryConfig,
}

#[derive(Default)]
struct Inner {
	conns: HashMap<u64, ConnectionEntry>,
	rooms: HashMap<Room, HashSet<u64>>,
	typing_farmers: HashMap<FarmerId, ConversationId>,
}

struct ConnectionEntry {
	principal: Principal,
	tx: OutboundTx,
	rooms: HashSet<Room>,
	connected_at_unix_ms: i64,
}

impl Inner {
	fn join_locked(&mut self, conn_id: u64, room: Room) -> Result<bool, GatewayError> {
		let Some(entry) = self.conns.get_mut(&conn_id) else {
			return Err(GatewayError::NotRegistered);
		};

		let newly = entry.rooms.insert(room.clone());
		if newly {
			self.rooms.entry(room).or_default().insert(conn_id);
		}
		Ok(newly)
	}
}

impl RoomRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			inner: RwLock::new(Inner::default()),
			cfg,
		}
	}

	/// Add a connection to the presence table and auto-join its kind-specific
	/// rooms: farmers get their personal room, agents additionally get the
	/// agent-scoped room, admins opt into monitoring explicitly.
	pub async fn register(&self, conn_id: u64, principal: Principal, tx: OutboundTx) {
		let mut inner = self.inner.write().await;

		inner.conns.insert(
			conn_id,
			ConnectionEntry {
				principal: principal.clone(),
				tx,
				rooms: HashSet::new(),
				connected_at_unix_ms: unix_ms_now(),
			},
		);

		let auto_rooms: Vec<Room> = match principal.kind {
			PrincipalKind::Farmer => vec![Room::User(principal.farmer_id.clone())],
			PrincipalKind::Admin => Vec::new(),
			PrincipalKind::AutomatedAgent => vec![
				Room::User(principal.farmer_id.clone()),
				Room::Agent(principal.farmer_id.clone()),
			],
		};

		for room in auto_rooms {
			// The entry was just inserted, so this cannot fail.
			let _ = inner.join_locked(conn_id, room);
		}

		metrics::gauge!("kisaan_gateway_registered_connections").increment(1.0);
		if self.cfg.debug_logs {
			debug!(conn_id, kind = %principal.kind, principal = %principal.principal_id, "registry: registered");
		}
	}

	/// Join an arbitrary room; fails loudly for unregistered connections.
	pub async fn join(&self, conn_id: u64, room: Room) -> Result<(), GatewayError> {
		let mut inner = self.inner.write().await;
		inner.join_locked(conn_id, room)?;
		Ok(())
	}

	pub async fn leave(&self, conn_id: u64, room: &Room) -> Result<(), GatewayError> {
		let mut inner = self.inner.write().await;
		let inner = &mut *inner;
		let Some(entry) = inner.conns.get_mut(&conn_id) else {
			return Err(GatewayError::NotRegistered);
		};

		if entry.rooms.remove(room)
			&& let Some(members) = inner.rooms.get_mut(room)
		{
			members.remove(&conn_id);
			if members.is_empty() {
				inner.rooms.remove(room);
			}
		}
		Ok(())
	}

	/// Fire-and-forget delivery to every connection in `room`; targets that
	/// disconnected between lookup and send are skipped silently. Returns how
	/// many queues accepted the event.
	pub async fn broadcast(&self, room: &Room, event: ServerEvent) -> usize {
		let targets: Vec<OutboundTx> = {
			let inner = self.inner.read().await;
			let Some(members) = inner.rooms.get(room) else {
				return 0;
			};
			members
				.iter()
				.filter_map(|id| inner.conns.get(id).map(|e| e.tx.clone()))
				.collect()
		};

		let mut delivered = 0usize;
		for tx in targets {
			if tx.try_send(Envelope::new(event.clone())).is_ok() {
				delivered += 1;
			}
		}

		metrics::counter!("kisaan_gateway_broadcast_events_total").increment(1);
		if self.cfg.debug_logs {
			debug!(room = %room, delivered, "registry: broadcast");
		}
		delivered
	}

	/// Direct delivery to one connection (acks, progress events).
	pub async fn send_to(&self, conn_id: u64, frame: ServerFrame) -> bool {
		let tx = {
			let inner = self.inner.read().await;
			inner.conns.get(&conn_id).map(|e| e.tx.clone())
		};

		match tx {
			Some(tx) => tx.try_send(frame).is_ok(),
			None => false,
		}
	}

	/// Remove a connection and all of its memberships. Idempotent: returns
	/// false if the connection was already gone.
	pub async fn deregister(&self, conn_id: u64) -> bool {
		let mut inner = self.inner.write().await;
		let Some(entry) = inner.conns.remove(&conn_id) else {
			return false;
		};

		for room in entry.rooms {
			if let Some(members) = inner.rooms.get_mut(&room) {
				members.remove(&conn_id);
				if members.is_empty() {
					inner.rooms.remove(&room);
				}
			}
		}

		metrics::gauge!("kisaan_gateway_registered_connections").decrement(1.0);
		if self.cfg.debug_logs {
			debug!(conn_id, "registry: deregistered");
		}
		true
	}

	pub async fn principal(&self, conn_id: u64) -> Option<Principal> {
		let inner = self.inner.read().await;
		inner.conns.get(&conn_id).map(|e| e.principal.clone())
	}

	pub async fn is_member(&self, conn_id: u64, room: &Room) -> bool {
		let inner = self.inner.read().await;
		inner.conns.get(&conn_id).map(|e| e.rooms.contains(room)).unwrap_or(false)
	}

	/// Number of connections currently in `room`.
	pub async fn room_size(&self, room: &Room) -> usize {
		let inner = self.inner.read().await;
		inner.rooms.get(room).map(HashSet::len).unwrap_or(0)
	}

	/// Record a farmer as typing in a conversation.
	pub async fn set_typing(&self, farmer_id: &FarmerId, conversation_id: ConversationId) {
		let mut inner = self.inner.write().await;
		inner.typing_farmers.insert(farmer_id.clone(), conversation_id);
	}

	/// Clear transient typing state; returns the conversation the farmer was
	/// typing in, if any.
	pub async fn clear_typing(&self, farmer_id: &FarmerId) -> Option<ConversationId> {
		let mut inner = self.inner.write().await;
		inner.typing_farmers.remove(farmer_id)
	}

	pub async fn is_typing(&self, farmer_id: &FarmerId) -> bool {
		let inner = self.inner.read().await;
		inner.typing_farmers.contains_key(farmer_id)
	}

	/// Read-only presence snapshot (counts and per-kind lists).
	pub async fn stats(&self) -> PresenceSnapshot {
		let inner = self.inner.read().await;

		let mut snapshot = PresenceSnapshot {
			total_connections: inner.conns.len(),
			..Default::default()
		};

		for entry in inner.conns.values() {
			let peer = PresencePeer {
				principal_id: entry.principal.principal_id.clone(),
				display_name: entry.principal.display_name.clone(),
				farmer_id: entry.principal.farmer_id.clone(),
				connected_at_unix_ms: entry.connected_at_unix_ms,
			};

			match entry.principal.kind {
				PrincipalKind::Farmer => snapshot.farmers.push(peer),
				PrincipalKind::Admin => snapshot.admins.push(peer),
				PrincipalKind::AutomatedAgent => snapshot.agents.push(peer),
			}
		}

		snapshot.farmers.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));
		snapshot.admins.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));
		snapshot.agents.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));
		snapshot
	}
}
