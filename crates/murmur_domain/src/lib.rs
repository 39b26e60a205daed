#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and levels from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown auth level: {0}")]
	UnknownAuthLevel(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Process-unique identifier of a live gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Account identifier as issued by the account store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId` without surrounding whitespace.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.trim() != id {
			return Err(ParseIdError::InvalidFormat("user id has surrounding whitespace".into()));
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Authentication tier a route or action requires.
///
/// Ordered: each level implies the ones before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthLevel {
	#[default]
	None,
	User,
	Admin,
	Sudo,
}

impl AuthLevel {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			AuthLevel::None => "none",
			AuthLevel::User => "user",
			AuthLevel::Admin => "admin",
			AuthLevel::Sudo => "sudo",
		}
	}
}

impl fmt::Display for AuthLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AuthLevel {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"none" | "public" => Ok(AuthLevel::None),
			"user" => Ok(AuthLevel::User),
			"admin" => Ok(AuthLevel::Admin),
			"sudo" => Ok(AuthLevel::Sudo),
			other => Err(ParseIdError::UnknownAuthLevel(other.to_string())),
		}
	}
}

/// Authenticated account as returned by identity verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub id: UserId,
	/// Display name. Not unique.
	pub name: String,
	#[serde(default)]
	pub admin: bool,
	/// End of the current sudo elevation (unix ms), if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sudo_until_ms: Option<i64>,
}

impl Identity {
	pub fn new(id: UserId, name: impl Into<String>) -> Self {
		Self {
			id,
			name: name.into(),
			admin: false,
			sudo_until_ms: None,
		}
	}

	pub fn with_admin(mut self, admin: bool) -> Self {
		self.admin = admin;
		self
	}

	pub fn with_sudo_until(mut self, until_ms: i64) -> Self {
		self.sudo_until_ms = Some(until_ms);
		self
	}

	/// Whether a sudo elevation is active at `now_ms`.
	pub fn is_sudo_active(&self, now_ms: i64) -> bool {
		self.admin && self.sudo_until_ms.is_some_and(|until| until > now_ms)
	}

	/// Highest level this identity satisfies at `now_ms`.
	pub fn level(&self, now_ms: i64) -> AuthLevel {
		if self.is_sudo_active(now_ms) {
			AuthLevel::Sudo
		} else if self.admin {
			AuthLevel::Admin
		} else {
			AuthLevel::User
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: &str) -> Identity {
		Identity::new(UserId::new(id).unwrap(), id)
	}

	#[test]
	fn auth_level_parse_and_display() {
		assert_eq!("ADMIN".parse::<AuthLevel>().unwrap(), AuthLevel::Admin);
		assert_eq!("public".parse::<AuthLevel>().unwrap(), AuthLevel::None);
		assert_eq!(AuthLevel::Sudo.to_string(), "sudo");
		assert!("root".parse::<AuthLevel>().is_err());
	}

	#[test]
	fn auth_levels_are_ordered() {
		assert!(AuthLevel::None < AuthLevel::User);
		assert!(AuthLevel::User < AuthLevel::Admin);
		assert!(AuthLevel::Admin < AuthLevel::Sudo);
	}

	#[test]
	fn rejects_empty_user_ids() {
		assert!(UserId::new("").is_err());
		assert!(UserId::new("   ").is_err());
		assert!(UserId::new(" x").is_err());
		assert_eq!("u1".parse::<UserId>().unwrap().as_str(), "u1");
	}

	#[test]
	fn sudo_requires_admin_and_unexpired_window() {
		let now = 1_000;
		assert_eq!(user("a").level(now), AuthLevel::User);

		let admin = user("b").with_admin(true);
		assert_eq!(admin.level(now), AuthLevel::Admin);

		let elevated = admin.clone().with_sudo_until(now + 1);
		assert!(elevated.is_sudo_active(now));
		assert_eq!(elevated.level(now), AuthLevel::Sudo);
		assert!(!elevated.is_sudo_active(now + 1));

		let not_admin = user("c").with_sudo_until(now + 10);
		assert!(!not_admin.is_sudo_active(now));
	}

	#[test]
	fn identity_deserializes_with_defaults() {
		let id: Identity = serde_json::from_str(r#"{"id":"u1","name":"ann"}"#).unwrap();
		assert!(!id.admin);
		assert_eq!(id.sudo_until_ms, None);
	}
}
