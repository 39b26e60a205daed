#![forbid(unsafe_code)]

use async_trait::async_trait;
use murmur_protocol::AppPacket;
use tracing::debug;

use crate::handlers::PacketHandler;
use crate::server::registry::Registry;
use crate::server::session::Session;

/// Accepts and drops every packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPacketHandler;

#[async_trait]
impl PacketHandler for NullPacketHandler {
	async fn handle(&self, session: &mut Session, _registry: &Registry, packet: AppPacket) -> anyhow::Result<()> {
		debug!(conn_id = %session.conn_id(), kind = %packet.kind, "null handler: dropping packet");
		Ok(())
	}
}
