#![forbid(unsafe_code)]

//! Application packet handlers.
//!
//! The gateway authenticates, rate limits and decodes packets; everything an
//! authorized client sends beyond the control packets lands in a
//! [`PacketHandler`].

pub mod null;
pub mod relay;

use async_trait::async_trait;
use murmur_protocol::AppPacket;

use crate::server::registry::Registry;
use crate::server::session::Session;

#[async_trait]
pub trait PacketHandler: Send + Sync {
	/// Handle one packet from an authorized session.
	///
	/// Errors are logged and answered with an `error` packet; the connection
	/// stays open.
	async fn handle(&self, session: &mut Session, registry: &Registry, packet: AppPacket) -> anyhow::Result<()>;
}
