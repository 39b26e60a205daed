#![forbid(unsafe_code)]

//! Per-connection decode state machine.
//!
//! [`FrameEngine`] owns the input accumulation buffer and the fragment
//! reassembly buffer. [`FrameEngine::feed`] is its only mutation entry point,
//! so it can be driven from socket reads or directly from tests.

use bytes::{Bytes, BytesMut};

use crate::framing::{
	DEFAULT_MAX_PAYLOAD, FramingError, MAX_HEADER_LEN, OpCode, encode_frame, try_decode_frame_from_buffer,
};

/// Limits applied by a [`FrameEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
	/// Largest accepted frame payload and reassembled message.
	pub max_payload: usize,
	/// Hard cap on bytes held in the accumulation buffer.
	pub max_buffer: usize,
}

impl EngineConfig {
	pub fn with_max_payload(max_payload: usize) -> Self {
		Self {
			max_payload,
			max_buffer: max_payload.saturating_add(MAX_HEADER_LEN),
		}
	}
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
	}
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
	Text(String),
	Binary(Bytes),
}

/// What the caller must do after a `feed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
	/// Deliver to the application.
	Message(Message),
	/// Write this encoded frame back to the peer.
	Reply(Bytes),
	/// The peer closed; flush replies, then drop the socket.
	Close,
}

/// Everything one [`FrameEngine::feed`] call produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Feed {
	/// Completed outputs, in wire order.
	pub outputs: Vec<EngineOutput>,
	/// Protocol violation that stopped decoding. Outputs before it still count.
	pub error: Option<FramingError>,
}

impl Feed {
	/// Outputs if decoding finished cleanly, otherwise the error.
	pub fn into_result(self) -> Result<Vec<EngineOutput>, FramingError> {
		match self.error {
			Some(e) => Err(e),
			None => Ok(self.outputs),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
	Text,
	Binary,
}

#[derive(Debug)]
pub struct FrameEngine {
	cfg: EngineConfig,
	buf: BytesMut,
	partial: BytesMut,
	partial_kind: Option<MessageKind>,
	closed: bool,
}

impl Default for FrameEngine {
	fn default() -> Self {
		Self::new(EngineConfig::default())
	}
}

impl FrameEngine {
	pub fn new(cfg: EngineConfig) -> Self {
		Self {
			cfg,
			buf: BytesMut::with_capacity(4 * 1024),
			partial: BytesMut::new(),
			partial_kind: None,
			closed: false,
		}
	}

	pub fn config(&self) -> EngineConfig {
		self.cfg
	}

	pub fn is_closed(&self) -> bool {
		self.closed
	}

	/// Bytes received but not yet forming a complete frame.
	pub fn buffered_len(&self) -> usize {
		self.buf.len()
	}

	/// Mark closed and drop buffered state. Further `feed` calls are no-ops.
	pub fn close(&mut self) {
		self.closed = true;
		self.buf = BytesMut::new();
		self.partial = BytesMut::new();
		self.partial_kind = None;
	}

	/// Consume newly arrived bytes and return everything they complete.
	///
	/// An error is fatal: the engine closes itself and drops whatever
	/// follows the violation. Outputs completed before it are still returned,
	/// so the result does not depend on how the bytes were chunked.
	pub fn feed(&mut self, bytes: &[u8]) -> Feed {
		let mut feed = Feed::default();
		if self.closed {
			return feed;
		}

		if let Err(e) = self.feed_inner(bytes, &mut feed.outputs) {
			self.close();
			feed.error = Some(e);
		}
		feed
	}

	fn feed_inner(&mut self, bytes: &[u8], out: &mut Vec<EngineOutput>) -> Result<(), FramingError> {
		self.buf.extend_from_slice(bytes);

		while let Some(frame) = try_decode_frame_from_buffer(&mut self.buf, self.cfg.max_payload)? {
			match frame.opcode {
				OpCode::Continuation => {
					let Some(kind) = self.partial_kind else {
						return Err(FramingError::UnexpectedContinuation);
					};
					self.append_partial(&frame.payload)?;

					if frame.fin {
						self.partial_kind = None;
						let data = self.partial.split().freeze();
						out.push(EngineOutput::Message(finish(kind, data)?));
					}
				}
				OpCode::Text | OpCode::Binary => {
					if self.partial_kind.is_some() {
						return Err(FramingError::InterleavedMessage);
					}

					let kind = if frame.opcode == OpCode::Text {
						MessageKind::Text
					} else {
						MessageKind::Binary
					};

					if frame.fin {
						out.push(EngineOutput::Message(finish(kind, frame.payload)?));
					} else {
						self.partial_kind = Some(kind);
						self.append_partial(&frame.payload)?;
					}
				}
				OpCode::Close => {
					out.push(EngineOutput::Reply(encode_frame(OpCode::Close, &[])));
					out.push(EngineOutput::Close);
					self.close();
					return Ok(());
				}
				OpCode::Ping => {
					out.push(EngineOutput::Reply(encode_frame(OpCode::Pong, &[])));
				}
				OpCode::Pong => {
					// The server never pings, so a pong is unsolicited.
					return Err(FramingError::UnexpectedOpcode(OpCode::Pong as u8));
				}
			}
		}

		// Whatever is left is at most one incomplete frame.
		if self.buf.len() > self.cfg.max_buffer {
			return Err(FramingError::BufferOverflow {
				len: self.buf.len(),
				max: self.cfg.max_buffer,
			});
		}

		Ok(())
	}

	fn append_partial(&mut self, payload: &[u8]) -> Result<(), FramingError> {
		let len = self.partial.len() + payload.len();
		if len > self.cfg.max_payload {
			return Err(FramingError::MessageTooLarge {
				len,
				max: self.cfg.max_payload,
			});
		}
		self.partial.extend_from_slice(payload);
		Ok(())
	}
}

fn finish(kind: MessageKind, data: Bytes) -> Result<Message, FramingError> {
	match kind {
		MessageKind::Text => {
			let text = std::str::from_utf8(&data).map_err(|_| FramingError::InvalidUtf8)?;
			Ok(Message::Text(text.to_owned()))
		}
		MessageKind::Binary => Ok(Message::Binary(data)),
	}
}
