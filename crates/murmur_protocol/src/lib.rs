#![forbid(unsafe_code)]

pub mod engine;
pub mod framing;
pub mod handshake;
pub mod packet;

pub use engine::{EngineConfig, EngineOutput, Feed, FrameEngine, Message};
pub use framing::{
	DEFAULT_MAX_PAYLOAD, Frame, FramingError, OpCode, decode_frame, encode_client_frame, encode_frame, encode_frame_into,
	encode_text, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
pub use handshake::{HandshakeError, UpgradeRequest, derive_accept_key};
pub use packet::{AppPacket, ControlPacket, InboundPacket, PacketError, ServerPacket};
