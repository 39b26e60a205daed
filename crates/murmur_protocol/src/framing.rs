#![forbid(unsafe_code)]

//! Wire format of a single frame (RFC 6455 section 5).
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |                 Masking-key, if MASK set to 1                 |
//! +---------------------------------------------------------------+
//! :                         Payload Data                          :
//! +---------------------------------------------------------------+
//! ```
//!
//! Clients must mask every frame; the server never masks.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default maximum payload of a single frame or reassembled message.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024; // 1 MiB

/// Largest possible header: 2 base bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0f;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7f;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
	Continuation = 0x0,
	Text = 0x1,
	Binary = 0x2,
	Close = 0x8,
	Ping = 0x9,
	Pong = 0xa,
}

impl OpCode {
	/// Parse the low nibble of the first header byte.
	pub const fn from_nibble(b: u8) -> Option<Self> {
		match b & OPCODE_BITS {
			0x0 => Some(OpCode::Continuation),
			0x1 => Some(OpCode::Text),
			0x2 => Some(OpCode::Binary),
			0x8 => Some(OpCode::Close),
			0x9 => Some(OpCode::Ping),
			0xa => Some(OpCode::Pong),
			_ => None,
		}
	}

	#[inline]
	pub const fn is_control(self) -> bool {
		(self as u8) & 0x08 != 0
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
	#[error("insufficient data: need={need} have={have}")]
	InsufficientData { need: usize, have: usize },

	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: u64, max: usize },

	#[error("reassembled message exceeds maximum size: len={len} max={max}")]
	MessageTooLarge { len: usize, max: usize },

	#[error("input buffer exceeds hard cap: len={len} max={max}")]
	BufferOverflow { len: usize, max: usize },

	#[error("client frame is not masked")]
	Unmasked,

	#[error("reserved bits set without a negotiated extension: {0:#04x}")]
	ReservedBits(u8),

	#[error("unexpected opcode: {0:#x}")]
	UnexpectedOpcode(u8),

	#[error("fragmented control frame: {0:?}")]
	FragmentedControl(OpCode),

	#[error("control frame payload too long: len={0}")]
	ControlTooLarge(u64),

	#[error("continuation frame without a message in progress")]
	UnexpectedContinuation,

	#[error("new data frame while a fragmented message is in progress")]
	InterleavedMessage,

	#[error("text message is not valid utf-8")]
	InvalidUtf8,
}

/// One decoded, unmasked frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub fin: bool,
	pub opcode: OpCode,
	pub payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct Head {
	fin: bool,
	opcode: OpCode,
	header_len: usize,
	payload_len: usize,
	mask: [u8; 4],
}

fn decode_head(src: &[u8], max_payload: usize) -> Result<Head, FramingError> {
	if src.len() < 2 {
		return Err(FramingError::InsufficientData {
			need: 2,
			have: src.len(),
		});
	}

	let b0 = src[0];
	let b1 = src[1];

	if b0 & RSV_BITS != 0 {
		return Err(FramingError::ReservedBits(b0 & RSV_BITS));
	}

	let fin = b0 & FIN_BIT != 0;
	let opcode = OpCode::from_nibble(b0).ok_or(FramingError::UnexpectedOpcode(b0 & OPCODE_BITS))?;

	if b1 & MASK_BIT == 0 {
		return Err(FramingError::Unmasked);
	}

	let (len, mut n) = match b1 & LEN_BITS {
		126 => {
			if src.len() < 4 {
				return Err(FramingError::InsufficientData {
					need: 4,
					have: src.len(),
				});
			}
			(u16::from_be_bytes([src[2], src[3]]) as u64, 4)
		}
		127 => {
			if src.len() < 10 {
				return Err(FramingError::InsufficientData {
					need: 10,
					have: src.len(),
				});
			}
			let mut raw = [0u8; 8];
			raw.copy_from_slice(&src[2..10]);
			(u64::from_be_bytes(raw), 10)
		}
		l => (l as u64, 2),
	};

	if len > max_payload as u64 {
		return Err(FramingError::FrameTooLarge { len, max: max_payload });
	}

	if opcode.is_control() {
		if !fin {
			return Err(FramingError::FragmentedControl(opcode));
		}
		if len > MAX_CONTROL_PAYLOAD as u64 {
			return Err(FramingError::ControlTooLarge(len));
		}
	}

	if src.len() < n + 4 {
		return Err(FramingError::InsufficientData {
			need: n + 4,
			have: src.len(),
		});
	}

	let mut mask = [0u8; 4];
	mask.copy_from_slice(&src[n..n + 4]);
	n += 4;

	Ok(Head {
		fin,
		opcode,
		header_len: n,
		payload_len: len as usize,
		mask,
	})
}

/// XOR `buf` with the 4-byte masking key, starting at key offset 0.
#[inline]
pub fn apply_mask(key: [u8; 4], buf: &mut [u8]) {
	for (i, b) in buf.iter_mut().enumerate() {
		*b ^= key[i & 0x03];
	}
}

/// Decode a single client frame from the start of `src`.
pub fn decode_frame(src: &[u8], max_payload: usize) -> Result<(Frame, usize), FramingError> {
	let head = decode_head(src, max_payload)?;

	let need = head.header_len + head.payload_len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let mut payload = BytesMut::from(&src[head.header_len..need]);
	apply_mask(head.mask, &mut payload);

	Ok((
		Frame {
			fin: head.fin,
			opcode: head.opcode,
			payload: payload.freeze(),
		},
		need,
	))
}

/// Try to decode a single client frame from a growable buffer.
///
/// Returns `Ok(None)` without consuming anything while the frame is incomplete.
pub fn try_decode_frame_from_buffer(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>, FramingError> {
	let head = match decode_head(&buf[..], max_payload) {
		Ok(head) => head,
		Err(FramingError::InsufficientData { .. }) => return Ok(None),
		Err(e) => return Err(e),
	};

	let need = head.header_len + head.payload_len;
	if buf.len() < need {
		return Ok(None);
	}

	let mut frame = buf.split_to(need);
	let mut payload = frame.split_off(head.header_len);
	apply_mask(head.mask, &mut payload);

	Ok(Some(Frame {
		fin: head.fin,
		opcode: head.opcode,
		payload: payload.freeze(),
	}))
}

/// Header length the server uses for a payload of `payload_len` bytes.
#[inline]
pub fn header_len_for_payload(payload_len: usize) -> usize {
	if payload_len < 126 {
		2
	} else if payload_len <= u16::MAX as usize {
		4
	} else {
		10
	}
}

/// Compute total server frame length (header + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	header_len_for_payload(payload_len) + payload_len
}

fn put_len(buf: &mut BytesMut, mask_bit: u8, len: usize) {
	if len < 126 {
		buf.put_u8(mask_bit | len as u8);
	} else if len <= u16::MAX as usize {
		buf.put_u8(mask_bit | 126);
		buf.put_u16(len as u16);
	} else {
		buf.put_u8(mask_bit | 127);
		buf.put_u64(len as u64);
	}
}

/// Append an unfragmented, unmasked server frame into the provided buffer.
pub fn encode_frame_into(buf: &mut BytesMut, opcode: OpCode, payload: &[u8]) {
	buf.reserve(frame_len_from_payload_len(payload.len()));
	buf.put_u8(FIN_BIT | opcode as u8);
	put_len(buf, 0, payload.len());
	buf.put_slice(payload);
}

/// Encode an unfragmented, unmasked server frame.
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(frame_len_from_payload_len(payload.len()));
	encode_frame_into(&mut buf, opcode, payload);
	buf.freeze()
}

/// Encode a text frame.
#[inline]
pub fn encode_text(text: &str) -> Bytes {
	encode_frame(OpCode::Text, text.as_bytes())
}

/// Encode a masked client frame. Used by clients and test harnesses.
pub fn encode_client_frame(fin: bool, opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
	let mut buf = BytesMut::with_capacity(frame_len_from_payload_len(payload.len()) + 4);
	let fin_bit = if fin { FIN_BIT } else { 0 };
	buf.put_u8(fin_bit | opcode as u8);
	put_len(&mut buf, MASK_BIT, payload.len());
	buf.put_slice(&mask);

	let start = buf.len();
	buf.put_slice(payload);
	apply_mask(mask, &mut buf[start..]);

	buf.to_vec()
}
