#![forbid(unsafe_code)]

//! Opening handshake (RFC 6455 section 4.2).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version the server speaks.
pub const SUPPORTED_VERSION: &str = "13";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
	#[error("upgrade requires GET, got {0}")]
	Method(String),

	#[error("missing or illegal upgrade header")]
	Upgrade,

	#[error("missing or illegal connection header")]
	Connection,

	#[error("missing sec-websocket-key header")]
	SecWebSocketKey,

	#[error("missing or unsupported sec-websocket-version")]
	SecWebSocketVersion,
}

/// Derive `sec-websocket-accept` from `sec-websocket-key`.
pub fn derive_accept_key(sec_key: &[u8]) -> String {
	let mut sha1 = Sha1::new();
	sha1.update(sec_key);
	sha1.update(GUID.as_bytes());
	STANDARD.encode(sha1.finalize())
}

/// The handshake-relevant parts of an HTTP request, borrowed from whatever
/// HTTP layer parsed it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpgradeRequest<'a> {
	pub method: &'a str,
	pub upgrade: Option<&'a str>,
	pub connection: Option<&'a str>,
	pub version: Option<&'a str>,
	pub key: Option<&'a str>,
}

impl<'a> UpgradeRequest<'a> {
	/// Whether the client asked for a websocket upgrade at all.
	pub fn is_upgrade_attempt(&self) -> bool {
		self.upgrade.is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
	}

	/// Validate the request and return the client key.
	pub fn validate(&self) -> Result<&'a str, HandshakeError> {
		if !self.method.eq_ignore_ascii_case("GET") {
			return Err(HandshakeError::Method(self.method.to_string()));
		}

		if !self.is_upgrade_attempt() {
			return Err(HandshakeError::Upgrade);
		}

		let has_upgrade_token = self
			.connection
			.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
		if !has_upgrade_token {
			return Err(HandshakeError::Connection);
		}

		if self.version.map(str::trim) != Some(SUPPORTED_VERSION) {
			return Err(HandshakeError::SecWebSocketVersion);
		}

		match self.key.map(str::trim) {
			Some(key) if !key.is_empty() => Ok(key),
			_ => Err(HandshakeError::SecWebSocketKey),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn valid() -> UpgradeRequest<'static> {
		UpgradeRequest {
			method: "GET",
			upgrade: Some("websocket"),
			connection: Some("keep-alive, Upgrade"),
			version: Some("13"),
			key: Some("dGhlIHNhbXBsZSBub25jZQ=="),
		}
	}

	#[test]
	fn derive_matches_rfc_sample() {
		assert_eq!(derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}

	#[test]
	fn validate_accepts_browser_style_request() {
		assert_eq!(valid().validate(), Ok("dGhlIHNhbXBsZSBub25jZQ=="));
	}

	#[test]
	fn validate_rejects_each_missing_piece() {
		let req = UpgradeRequest { method: "POST", ..valid() };
		assert!(matches!(req.validate(), Err(HandshakeError::Method(_))));

		let req = UpgradeRequest { upgrade: None, ..valid() };
		assert_eq!(req.validate(), Err(HandshakeError::Upgrade));

		let req = UpgradeRequest {
			connection: Some("keep-alive"),
			..valid()
		};
		assert_eq!(req.validate(), Err(HandshakeError::Connection));

		let req = UpgradeRequest {
			version: Some("8"),
			..valid()
		};
		assert_eq!(req.validate(), Err(HandshakeError::SecWebSocketVersion));

		let req = UpgradeRequest { key: Some("  "), ..valid() };
		assert_eq!(req.validate(), Err(HandshakeError::SecWebSocketKey));
	}
}
