#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt as _;
use murmur_protocol::{
	AppPacket, ControlPacket, EngineConfig, EngineOutput, Feed, FrameEngine, FramingError, InboundPacket, Message,
	OpCode, ServerPacket, encode_frame,
};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tracing::{debug, error, info, warn};

use crate::server::rate_limit::{
	AUTHORIZE_BUCKET, PACKET_BUCKET, PACKET_MINUTE_BUCKET, RateLimitError, address_key, user_key,
};
use crate::server::registry::{Registration, Registry};
use crate::server::session::Session;

/// Per-connection settings shared by every gateway connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub engine: EngineConfig,
	/// Unauthorized connections are closed after this long.
	pub auth_timeout: Duration,
	pub outbound_queue_capacity: usize,
	pub read_buffer_bytes: usize,
	/// Bucket charged per authorize attempt, keyed by address.
	pub authorize_bucket: String,
	/// Buckets charged per application packet, keyed by user.
	pub packet_buckets: Vec<String>,
	/// How long a closing connection may take to flush its queue.
	pub flush_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			engine: EngineConfig::default(),
			auth_timeout: Duration::from_secs(10),
			outbound_queue_capacity: 256,
			read_buffer_bytes: 8 * 1024,
			authorize_bucket: AUTHORIZE_BUCKET.to_string(),
			packet_buckets: vec![PACKET_BUCKET.to_string(), PACKET_MINUTE_BUCKET.to_string()],
			flush_timeout: Duration::from_secs(5),
		}
	}
}

/// Why a connection stopped reading.
#[derive(Debug)]
enum Exit {
	/// Peer sent a close frame; the echo is already queued.
	PeerClose,
	/// Peer sent a `close` packet.
	CloseRequested,
	Eof,
	Io(std::io::Error),
	Protocol(FramingError),
	AuthTimeout,
	/// Closed through the registry.
	Kicked,
	/// Packet not allowed before authorization.
	Rejected(&'static str),
}

impl Exit {
	fn sends_close_frame(&self) -> bool {
		matches!(
			self,
			Exit::CloseRequested | Exit::AuthTimeout | Exit::Kicked | Exit::Rejected(_)
		)
	}
}

enum Flow {
	Continue,
	Stop(Exit),
}

pub(crate) async fn run_connection<S>(registry: Registry, addr: SocketAddr, io: S, registration: Registration)
where
	S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("murmur_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("murmur_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let Registration {
		conn_id,
		outbound,
		mut outbound_rx,
		close_rx,
	} = registration;

	let (reader, mut writer) = tokio::io::split(io);

	let writer_task = tokio::spawn(async move {
		while let Some(frame) = outbound_rx.recv().await {
			if let Err(e) = writer.write_all(&frame).await {
				debug!(%conn_id, error = %e, "gateway write failed");
				break;
			}
		}
		let _ = writer.shutdown().await;
	});

	let mut session = Session::new(conn_id, addr, outbound);
	let exit = read_loop(&registry, &mut session, reader, close_rx).await;

	match &exit {
		Exit::Protocol(e) => {
			metrics::counter!("murmur_protocol_violations_total").increment(1);
			warn!(%conn_id, %addr, error = %e, "protocol violation; closing");
		}
		Exit::Io(e) => debug!(%conn_id, %addr, error = %e, "gateway read failed"),
		Exit::AuthTimeout => info!(%conn_id, %addr, "no authorize before deadline; closing"),
		Exit::Rejected(kind) => info!(%conn_id, %addr, kind, "packet before authorize; closing"),
		other => debug!(%conn_id, %addr, reason = ?other, "gateway connection closing"),
	}

	if exit.sends_close_frame() {
		session.send(encode_frame(OpCode::Close, &[]));
	}

	let settings = registry.settings().clone();
	drop(session);

	if let Some(identity) = registry.unregister(conn_id).await {
		info!(%conn_id, user = %identity.id, "authorized connection closed");
		registry.publish_presence().await;
	}

	let abort = writer_task.abort_handle();
	if tokio::time::timeout(settings.flush_timeout, writer_task).await.is_err() {
		debug!(%conn_id, "writer did not flush in time");
		abort.abort();
	}
}

async fn read_loop<R>(
	registry: &Registry,
	session: &mut Session,
	mut reader: R,
	mut close_rx: tokio::sync::watch::Receiver<bool>,
) -> Exit
where
	R: AsyncRead + Unpin,
{
	let settings = registry.settings();
	let mut engine = FrameEngine::new(settings.engine);
	let mut buf = vec![0u8; settings.read_buffer_bytes.max(1)];

	let deadline = tokio::time::sleep(settings.auth_timeout);
	tokio::pin!(deadline);

	loop {
		let n = tokio::select! {
			biased;

			changed = close_rx.changed() => {
				if changed.is_err() || *close_rx.borrow() {
					return Exit::Kicked;
				}
				continue;
			}
			_ = &mut deadline, if !session.is_authorized() => {
				return Exit::AuthTimeout;
			}
			read = reader.read(&mut buf) => match read {
				Ok(0) => return Exit::Eof,
				Ok(n) => n,
				Err(e) => return Exit::Io(e),
			},
		};

		let Feed { outputs, error } = engine.feed(&buf[..n]);
		metrics::counter!("murmur_frames_in_total").increment(outputs.len() as u64);

		for output in outputs {
			match output {
				EngineOutput::Reply(frame) => {
					session.send(frame);
				}
				EngineOutput::Close => return Exit::PeerClose,
				EngineOutput::Message(Message::Text(text)) => {
					if let Flow::Stop(exit) = on_text(registry, session, &text).await {
						engine.close();
						return exit;
					}
				}
				EngineOutput::Message(Message::Binary(data)) => {
					if !session.is_authorized() {
						engine.close();
						return Exit::Rejected("binary");
					}
					debug!(conn_id = %session.conn_id(), len = data.len(), "binary message ignored");
					session.send_packet(&ServerPacket::Error {
						message: "binary messages are not supported".into(),
					});
				}
			}
		}

		if let Some(e) = error {
			return Exit::Protocol(e);
		}
	}
}

async fn on_text(registry: &Registry, session: &mut Session, text: &str) -> Flow {
	let packet = match InboundPacket::parse(text) {
		Ok(p) => p,
		Err(e) => {
			if !session.is_authorized() {
				return Flow::Stop(Exit::Rejected("malformed"));
			}
			debug!(conn_id = %session.conn_id(), error = %e, "malformed packet");
			session.send_packet(&ServerPacket::Error {
				message: "malformed packet".into(),
			});
			return Flow::Continue;
		}
	};

	match packet {
		InboundPacket::Control(ControlPacket::Ping) => {
			session.send_packet(&ServerPacket::Pong);
			Flow::Continue
		}
		InboundPacket::Control(ControlPacket::Authorize { token }) => {
			if session.is_authorized() {
				session.send_packet(&ServerPacket::Error {
					message: "already authorized".into(),
				});
			} else {
				authorize(registry, session, token).await;
			}
			Flow::Continue
		}
		other if !session.is_authorized() => Flow::Stop(Exit::Rejected(kind_label(&other))),
		InboundPacket::Control(ControlPacket::Close) => Flow::Stop(Exit::CloseRequested),
		InboundPacket::App(app) => {
			on_app_packet(registry, session, app).await;
			Flow::Continue
		}
	}
}

fn kind_label(packet: &InboundPacket) -> &'static str {
	match packet {
		InboundPacket::Control(c) => c.kind(),
		InboundPacket::App(_) => "app",
	}
}

async fn authorize(registry: &Registry, session: &mut Session, token: String) {
	let conn_id = session.conn_id();
	let settings = registry.settings();
	let key = address_key(session.addr().ip());

	match registry.limiter().consume(&settings.authorize_bucket, &key, 1) {
		Ok(true) => {}
		Ok(false) => {
			metrics::counter!("murmur_rate_limited_total", "scope" => "authorize").increment(1);
			let retry_after_ms = registry
				.limiter()
				.max_retry_after(&[settings.authorize_bucket.as_str()], &key)
				.unwrap_or(0);
			info!(%conn_id, retry_after_ms, "authorize rate limited");
			session.send_packet(&ServerPacket::AuthorizeFailed {
				reason: "rate_limited".into(),
				retry_after_ms: Some(retry_after_ms),
			});
			return;
		}
		Err(e) => {
			error!(%conn_id, error = %e, "authorize bucket missing; rejecting");
			session.send_packet(&ServerPacket::AuthorizeFailed {
				reason: "unavailable".into(),
				retry_after_ms: None,
			});
			return;
		}
	}

	let identity = match registry.verifier().verify(&token).await {
		Ok(Some(identity)) => identity,
		Ok(None) => {
			info!(%conn_id, addr = %session.addr(), "authorize rejected");
			session.send_packet(&ServerPacket::AuthorizeFailed {
				reason: "invalid_credential".into(),
				retry_after_ms: None,
			});
			return;
		}
		Err(e) => {
			warn!(%conn_id, error = %e, "identity verifier failed");
			session.send_packet(&ServerPacket::AuthorizeFailed {
				reason: "unavailable".into(),
				retry_after_ms: None,
			});
			return;
		}
	};

	if !registry.bind_identity(conn_id, identity.clone(), token).await {
		return;
	}

	info!(%conn_id, user = %identity.id, admin = identity.admin, "authorized");
	let name = identity.name.clone();
	session.authorize(identity);
	session.send_packet(&ServerPacket::Authorized { user: name });
	registry.publish_presence().await;
}

async fn on_app_packet(registry: &Registry, session: &mut Session, packet: AppPacket) {
	let conn_id = session.conn_id();
	let Some(identity) = session.identity() else {
		return;
	};

	let settings = registry.settings();
	let key = user_key(identity.id.as_str());

	match registry
		.limiter()
		.consume2(settings.packet_buckets.as_slice(), &key, identity.admin, 1)
	{
		Ok(true) => {}
		Ok(false) => {
			metrics::counter!("murmur_rate_limited_total", "scope" => "packet").increment(1);
			let retry_after_ms = registry
				.limiter()
				.max_retry_after(settings.packet_buckets.as_slice(), &key)
				.unwrap_or(0);
			debug!(%conn_id, kind = %packet.kind, retry_after_ms, "packet rate limited");
			session.send_packet(&ServerPacket::RateLimited { retry_after_ms });
			return;
		}
		Err(e) => {
			quota_unavailable(session, &e);
			return;
		}
	}

	let kind = packet.kind.clone();
	let result = AssertUnwindSafe(registry.handler().handle(session, registry, packet))
		.catch_unwind()
		.await;

	let failed = match result {
		Ok(Ok(())) => false,
		Ok(Err(e)) => {
			warn!(%conn_id, %kind, error = %e, "packet handler failed");
			true
		}
		Err(_) => {
			error!(%conn_id, %kind, "packet handler panicked");
			true
		}
	};

	if failed {
		session.send_packet(&ServerPacket::Error {
			message: format!("{kind} failed"),
		});
	}
}

fn quota_unavailable(session: &Session, e: &RateLimitError) {
	error!(conn_id = %session.conn_id(), error = %e, "rate limit bucket missing; rejecting");
	session.send_packet(&ServerPacket::Error {
		message: "unavailable".into(),
	});
}
