#![forbid(unsafe_code)]

//! JSON application packets carried in text frames.
//!
//! Every packet is an object with a `type` discriminator (`packet` is
//! accepted as an alias). The gateway itself only understands the control
//! packets; everything else is handed to application logic as an
//! [`AppPacket`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::framing::encode_text;

#[derive(Debug, Error)]
pub enum PacketError {
	#[error("packet is not valid json: {0}")]
	Json(#[from] serde_json::Error),

	#[error("packet is not a json object")]
	NotAnObject,

	#[error("packet has no type discriminator")]
	MissingType,

	#[error("packet type is not a string")]
	InvalidType,
}

/// Packets the gateway handles itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPacket {
	Authorize {
		#[serde(alias = "credential")]
		token: String,
	},
	Ping,
	Close,
}

impl ControlPacket {
	pub const fn kind(&self) -> &'static str {
		match self {
			ControlPacket::Authorize { .. } => "authorize",
			ControlPacket::Ping => "ping",
			ControlPacket::Close => "close",
		}
	}
}

/// A packet for application logic. `body` still contains the discriminator.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPacket {
	pub kind: String,
	pub body: Map<String, Value>,
}

impl AppPacket {
	pub fn new(kind: impl Into<String>, mut body: Map<String, Value>) -> Self {
		let kind = kind.into();
		body.insert("type".to_string(), Value::String(kind.clone()));
		Self { kind, body }
	}

	pub fn get_str(&self, field: &str) -> Option<&str> {
		self.body.get(field).and_then(Value::as_str)
	}

	pub fn to_json(&self) -> String {
		Value::Object(self.body.clone()).to_string()
	}
}

/// Inbound packet after the discriminator decode step.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPacket {
	Control(ControlPacket),
	App(AppPacket),
}

impl InboundPacket {
	pub fn parse(text: &str) -> Result<Self, PacketError> {
		let Value::Object(mut body) = serde_json::from_str::<Value>(text)? else {
			return Err(PacketError::NotAnObject);
		};

		let kind = match body.get("type").or_else(|| body.get("packet")) {
			Some(Value::String(s)) => s.clone(),
			Some(_) => return Err(PacketError::InvalidType),
			None => return Err(PacketError::MissingType),
		};

		match kind.as_str() {
			"authorize" | "ping" | "close" => {
				body.remove("packet");
				body.insert("type".to_string(), Value::String(kind));
				let packet = serde_json::from_value::<ControlPacket>(Value::Object(body))?;
				Ok(InboundPacket::Control(packet))
			}
			_ => Ok(InboundPacket::App(AppPacket { kind, body })),
		}
	}

	pub fn kind(&self) -> &str {
		match self {
			InboundPacket::Control(c) => c.kind(),
			InboundPacket::App(a) => &a.kind,
		}
	}
}

/// Packets the gateway emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPacket {
	Authorized {
		user: String,
	},
	AuthorizeFailed {
		reason: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		retry_after_ms: Option<u64>,
	},
	Pong,
	Presence {
		users: Vec<String>,
	},
	/// Ask the client to reload and reconnect.
	Reload,
	RateLimited {
		retry_after_ms: u64,
	},
	Error {
		message: String,
	},
}

impl ServerPacket {
	pub fn to_json(&self) -> Result<String, PacketError> {
		Ok(serde_json::to_string(self)?)
	}

	/// Serialize and wrap in a text frame.
	pub fn encode(&self) -> Result<Bytes, PacketError> {
		Ok(encode_text(&self.to_json()?))
	}
}
