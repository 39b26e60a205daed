#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use murmur_domain::{ConnId, Identity};
use murmur_protocol::ServerPacket;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error};

/// Per-connection state owned by the connection task.
#[derive(Debug)]
pub struct Session {
	conn_id: ConnId,
	addr: SocketAddr,
	identity: Option<Identity>,
	outbound: mpsc::Sender<Bytes>,
	/// Free-form state for packet handlers.
	pub data: Map<String, Value>,
}

impl Session {
	pub(crate) fn new(conn_id: ConnId, addr: SocketAddr, outbound: mpsc::Sender<Bytes>) -> Self {
		Self {
			conn_id,
			addr,
			identity: None,
			outbound,
			data: Map::new(),
		}
	}

	pub fn conn_id(&self) -> ConnId {
		self.conn_id
	}

	pub fn addr(&self) -> SocketAddr {
		self.addr
	}

	pub fn identity(&self) -> Option<&Identity> {
		self.identity.as_ref()
	}

	pub fn is_authorized(&self) -> bool {
		self.identity.is_some()
	}

	pub(crate) fn authorize(&mut self, identity: Identity) {
		self.identity = Some(identity);
	}

	/// Queue an encoded frame for this connection. Returns false when the
	/// queue is full or the connection is gone.
	pub fn send(&self, frame: Bytes) -> bool {
		match self.outbound.try_send(frame) {
			Ok(()) => true,
			Err(TrySendError::Full(_)) => {
				metrics::counter!("murmur_fanout_dropped_total").increment(1);
				debug!(conn_id = %self.conn_id, "outbound queue full; reply dropped");
				false
			}
			Err(TrySendError::Closed(_)) => false,
		}
	}

	pub fn send_packet(&self, packet: &ServerPacket) -> bool {
		match packet.encode() {
			Ok(frame) => self.send(frame),
			Err(e) => {
				error!(conn_id = %self.conn_id, error = %e, "failed to encode server packet");
				false
			}
		}
	}
}
