#![forbid(unsafe_code)]

//! Live gateway connections.
//!
//! Every accepted connection gets an entry holding its outbound queue and a
//! close signal. The connection task owns the socket; the registry only
//! queues frames and flips close flags, so no lock is ever held while a
//! socket is written.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use murmur_domain::{ConnId, Identity, UserId};
use murmur_protocol::{PacketError, ServerPacket};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info};

use crate::handlers::PacketHandler;
use crate::server::auth::IdentityVerifier;
use crate::server::connection::{ConnectionSettings, run_connection};
use crate::server::rate_limit::RateLimiter;

#[derive(Debug)]
struct Entry {
	addr: SocketAddr,
	identity: Option<Identity>,
	credential: Option<String>,
	outbound: mpsc::Sender<Bytes>,
	close: watch::Sender<bool>,
}

/// Channels handed to the connection task by [`Registry::register`].
#[derive(Debug)]
pub(crate) struct Registration {
	pub conn_id: ConnId,
	pub outbound: mpsc::Sender<Bytes>,
	pub outbound_rx: mpsc::Receiver<Bytes>,
	pub close_rx: watch::Receiver<bool>,
}

/// Admin view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
	pub conn_id: u64,
	pub addr: String,
	pub user: Option<String>,
	pub name: Option<String>,
}

struct Shared {
	entries: RwLock<HashMap<ConnId, Entry>>,
	next_id: AtomicU64,
	settings: ConnectionSettings,
	limiter: RateLimiter,
	verifier: Arc<dyn IdentityVerifier>,
	handler: Arc<dyn PacketHandler>,
}

#[derive(Clone)]
pub struct Registry {
	shared: Arc<Shared>,
}

impl Registry {
	pub fn new(
		settings: ConnectionSettings,
		limiter: RateLimiter,
		verifier: Arc<dyn IdentityVerifier>,
		handler: Arc<dyn PacketHandler>,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				entries: RwLock::new(HashMap::new()),
				next_id: AtomicU64::new(1),
				settings,
				limiter,
				verifier,
				handler,
			}),
		}
	}

	pub fn settings(&self) -> &ConnectionSettings {
		&self.shared.settings
	}

	pub fn limiter(&self) -> &RateLimiter {
		&self.shared.limiter
	}

	pub(crate) fn verifier(&self) -> &dyn IdentityVerifier {
		self.shared.verifier.as_ref()
	}

	pub(crate) fn handler(&self) -> &dyn PacketHandler {
		self.shared.handler.as_ref()
	}

	/// Register an already-upgraded stream and start serving it.
	pub async fn accept<S>(&self, io: S, addr: SocketAddr) -> ConnId
	where
		S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	{
		let registration = self.register(addr).await;
		let conn_id = registration.conn_id;

		metrics::counter!("murmur_connections_total").increment(1);
		info!(%conn_id, %addr, "gateway connection accepted");

		tokio::spawn(run_connection(self.clone(), addr, io, registration));
		conn_id
	}

	pub(crate) async fn register(&self, addr: SocketAddr) -> Registration {
		let conn_id = ConnId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
		let (outbound, outbound_rx) = mpsc::channel(self.shared.settings.outbound_queue_capacity.max(1));
		let (close, close_rx) = watch::channel(false);

		self.shared.entries.write().await.insert(
			conn_id,
			Entry {
				addr,
				identity: None,
				credential: None,
				outbound: outbound.clone(),
				close,
			},
		);

		Registration {
			conn_id,
			outbound,
			outbound_rx,
			close_rx,
		}
	}

	/// Drop the entry. Returns the identity it was bound to, if any.
	pub(crate) async fn unregister(&self, conn_id: ConnId) -> Option<Identity> {
		let entry = self.shared.entries.write().await.remove(&conn_id)?;
		entry.identity
	}

	/// Attach an identity after a successful authorize. False if the
	/// connection is already gone.
	pub(crate) async fn bind_identity(&self, conn_id: ConnId, identity: Identity, credential: String) -> bool {
		let mut entries = self.shared.entries.write().await;
		match entries.get_mut(&conn_id) {
			Some(entry) => {
				entry.identity = Some(identity);
				entry.credential = Some(credential);
				true
			}
			None => false,
		}
	}

	#[allow(dead_code)]
	pub async fn identity(&self, conn_id: ConnId) -> Option<Identity> {
		let entries = self.shared.entries.read().await;
		entries.get(&conn_id).and_then(|e| e.identity.clone())
	}

	pub async fn connection_count(&self) -> usize {
		self.shared.entries.read().await.len()
	}

	pub async fn connections(&self) -> Vec<ConnectionInfo> {
		let entries = self.shared.entries.read().await;
		let mut out: Vec<ConnectionInfo> = entries
			.iter()
			.map(|(conn_id, e)| ConnectionInfo {
				conn_id: conn_id.0,
				addr: e.addr.to_string(),
				user: e.identity.as_ref().map(|i| i.id.to_string()),
				name: e.identity.as_ref().map(|i| i.name.clone()),
			})
			.collect();
		out.sort_by_key(|c| c.conn_id);
		out
	}

	/// Ask one connection to close.
	pub async fn close(&self, conn_id: ConnId) -> bool {
		let entries = self.shared.entries.read().await;
		match entries.get(&conn_id) {
			Some(entry) => {
				entry.close.send_replace(true);
				true
			}
			None => false,
		}
	}

	/// Close every connection authenticated as `user`.
	pub async fn close_by_identity(&self, user: &UserId) -> usize {
		let closed = self.close_where(|e| e.identity.as_ref().is_some_and(|i| &i.id == user)).await;
		info!(user = %user, closed, "closed connections by identity");
		closed
	}

	/// Close every connection that authorized with `credential`.
	pub async fn close_by_credential(&self, credential: &str) -> usize {
		let closed = self.close_where(|e| e.credential.as_deref() == Some(credential)).await;
		info!(closed, "closed connections by credential");
		closed
	}

	async fn close_where(&self, pred: impl Fn(&Entry) -> bool) -> usize {
		let entries = self.shared.entries.read().await;
		let mut closed = 0;
		for entry in entries.values().filter(|e| pred(e)) {
			entry.close.send_replace(true);
			closed += 1;
		}
		closed
	}

	#[allow(dead_code)]
	pub async fn send_to(&self, conn_id: ConnId, frame: Bytes) -> bool {
		let target = {
			let entries = self.shared.entries.read().await;
			entries.get(&conn_id).map(|e| (conn_id, e.outbound.clone()))
		};
		match target {
			Some(t) => deliver(vec![t], &frame) == 1,
			None => false,
		}
	}

	/// Queue `frame` on every connection. Returns how many accepted it.
	pub async fn broadcast(&self, frame: Bytes) -> usize {
		let targets = self.targets(|_| true).await;
		deliver(targets, &frame)
	}

	/// Queue `frame` on every authorized connection except `except`.
	pub async fn broadcast_authenticated(&self, frame: Bytes, except: Option<ConnId>) -> usize {
		let targets = self.targets(|e| e.identity.is_some()).await;
		let targets = targets.into_iter().filter(|(id, _)| Some(*id) != except).collect();
		deliver(targets, &frame)
	}

	/// Queue `frame` on every connection from `ip`.
	pub async fn broadcast_to_address(&self, ip: IpAddr, frame: Bytes) -> usize {
		let targets = self.targets(|e| e.addr.ip() == ip).await;
		deliver(targets, &frame)
	}

	pub async fn broadcast_packet(&self, packet: &ServerPacket) -> Result<usize, PacketError> {
		let frame = packet.encode()?;
		Ok(self.broadcast(frame).await)
	}

	async fn targets(&self, pred: impl Fn(&Entry) -> bool) -> Vec<(ConnId, mpsc::Sender<Bytes>)> {
		let entries = self.shared.entries.read().await;
		entries
			.iter()
			.filter(|(_, e)| pred(e))
			.map(|(id, e)| (*id, e.outbound.clone()))
			.collect()
	}

	/// Sorted, de-duplicated user ids of authorized connections.
	///
	/// Names are not unique, so two users sharing one still count twice.
	pub async fn presence_snapshot(&self) -> Vec<String> {
		let entries = self.shared.entries.read().await;
		let ids: BTreeSet<&UserId> = entries.values().filter_map(|e| e.identity.as_ref().map(|i| &i.id)).collect();
		ids.into_iter().map(|id| id.as_str().to_string()).collect()
	}

	/// Send the current presence list to every connection.
	pub async fn publish_presence(&self) -> usize {
		let users = self.presence_snapshot().await;
		match self.broadcast_packet(&ServerPacket::Presence { users }).await {
			Ok(n) => n,
			Err(e) => {
				debug!(error = %e, "failed to encode presence");
				0
			}
		}
	}
}

fn deliver(targets: Vec<(ConnId, mpsc::Sender<Bytes>)>, frame: &Bytes) -> usize {
	let mut delivered = 0;
	let mut dropped: u64 = 0;

	for (conn_id, tx) in targets {
		match tx.try_send(frame.clone()) {
			Ok(()) => delivered += 1,
			Err(TrySendError::Full(_)) => {
				dropped += 1;
				debug!(%conn_id, "outbound queue full; frame dropped");
			}
			Err(TrySendError::Closed(_)) => {}
		}
	}

	if dropped > 0 {
		metrics::counter!("murmur_fanout_dropped_total").increment(dropped);
	}
	delivered
}
