#![forbid(unsafe_code)]

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use murmur_protocol::{AppPacket, encode_text};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::handlers::PacketHandler;
use crate::server::registry::Registry;
use crate::server::session::Session;
use crate::util::time::unix_ms_now;

pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Minimum spacing between relayed `typing` packets from one connection.
pub const TYPING_INTERVAL_MS: i64 = 2_000;

const LAST_TYPING_KEY: &str = "relay.last_typing_ms";

/// Relays chat to every authorized connection.
///
/// `message` packets go to everyone including the sender, stamped with the
/// sender's id and name. `typing` packets go to everyone else, at most once
/// per [`TYPING_INTERVAL_MS`] per connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayPacketHandler;

#[async_trait]
impl PacketHandler for RelayPacketHandler {
	async fn handle(&self, session: &mut Session, registry: &Registry, packet: AppPacket) -> anyhow::Result<()> {
		let identity = session.identity().ok_or_else(|| anyhow!("relay requires an authorized session"))?;
		let author = json!({ "id": identity.id.as_str(), "name": identity.name });

		match packet.kind.as_str() {
			"message" => {
				let content = packet
					.get_str("content")
					.map(str::trim)
					.filter(|c| !c.is_empty())
					.ok_or_else(|| anyhow!("message needs non-empty content"))?;
				if content.chars().count() > MAX_MESSAGE_CHARS {
					bail!("message longer than {MAX_MESSAGE_CHARS} characters");
				}

				let mut body = Map::new();
				body.insert("author".into(), author);
				body.insert("content".into(), Value::String(content.to_string()));
				body.insert("sent_at_ms".into(), Value::from(unix_ms_now()));
				let out = AppPacket::new("message", body);

				let delivered = registry.broadcast_authenticated(encode_text(&out.to_json()), None).await;
				debug!(conn_id = %session.conn_id(), delivered, "relayed message");
				Ok(())
			}
			"typing" => {
				let now = unix_ms_now();
				let last = session.data.get(LAST_TYPING_KEY).and_then(Value::as_i64);
				if last.is_some_and(|last| now.saturating_sub(last) < TYPING_INTERVAL_MS) {
					return Ok(());
				}
				session.data.insert(LAST_TYPING_KEY.to_string(), Value::from(now));

				let mut body = Map::new();
				body.insert("author".into(), author);
				let out = AppPacket::new("typing", body);

				registry
					.broadcast_authenticated(encode_text(&out.to_json()), Some(session.conn_id()))
					.await;
				Ok(())
			}
			other => bail!("unsupported packet type {other:?}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::net::{IpAddr, Ipv4Addr, SocketAddr};
	use std::sync::Arc;

	use murmur_domain::{Identity, UserId};

	use super::*;
	use crate::handlers::null::NullPacketHandler;
	use crate::server::auth::StaticVerifier;
	use crate::server::connection::ConnectionSettings;
	use crate::server::rate_limit::RateLimiter;
	use crate::server::registry::Registration;

	fn identity(id: &str) -> Identity {
		Identity::new(UserId::new(id).expect("valid UserId"), id.to_uppercase())
	}

	async fn join(registry: &Registry, id: &str) -> (Session, Registration) {
		let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
		let reg = registry.register(addr).await;
		assert!(registry.bind_identity(reg.conn_id, identity(id), id.to_string()).await);
		let mut session = Session::new(reg.conn_id, addr, reg.outbound.clone());
		session.authorize(identity(id));
		(session, reg)
	}

	fn registry() -> Registry {
		Registry::new(
			ConnectionSettings::default(),
			RateLimiter::default(),
			Arc::new(StaticVerifier::new()),
			Arc::new(NullPacketHandler),
		)
	}

	fn packet(json: &str) -> AppPacket {
		match murmur_protocol::InboundPacket::parse(json).unwrap() {
			murmur_protocol::InboundPacket::App(p) => p,
			other => panic!("expected app packet, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn typing_skips_sender_and_is_throttled() {
		let registry = registry();
		let (mut ann, mut ann_reg) = join(&registry, "ann").await;
		let (_bob, mut bob_reg) = join(&registry, "bob").await;

		let handler = RelayPacketHandler;
		handler.handle(&mut ann, &registry, packet(r#"{"type":"typing"}"#)).await.unwrap();
		handler.handle(&mut ann, &registry, packet(r#"{"type":"typing"}"#)).await.unwrap();

		assert!(bob_reg.outbound_rx.try_recv().is_ok());
		assert!(bob_reg.outbound_rx.try_recv().is_err(), "second typing should be throttled");
		assert!(ann_reg.outbound_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn invalid_messages_are_rejected() {
		let registry = registry();
		let (mut ann, mut ann_reg) = join(&registry, "ann").await;
		let handler = RelayPacketHandler;

		let blank = packet(r#"{"type":"message","content":"   "}"#);
		assert!(handler.handle(&mut ann, &registry, blank).await.is_err());

		let long = "x".repeat(MAX_MESSAGE_CHARS + 1);
		let too_long = packet(&format!(r#"{{"type":"message","content":"{long}"}}"#));
		assert!(handler.handle(&mut ann, &registry, too_long).await.is_err());

		let unknown = packet(r#"{"type":"dance"}"#);
		assert!(handler.handle(&mut ann, &registry, unknown).await.is_err());

		assert!(ann_reg.outbound_rx.try_recv().is_err());
	}
}
