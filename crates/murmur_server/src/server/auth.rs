#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use murmur_domain::{Identity, UserId};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::config::SecretString;
use crate::util::time::unix_ms_now;

/// Resolves a client credential to an identity.
///
/// `Ok(None)` means the credential is not valid. `Err` means the verifier
/// itself failed; callers treat both as a failed authorization.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
	async fn verify(&self, token: &str) -> anyhow::Result<Option<Identity>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub admin: bool,
	#[serde(default)]
	pub sudo_until_ms: Option<i64>,
	/// Expiry, unix seconds.
	pub exp: u64,
}

impl AuthClaims {
	pub fn into_identity(self) -> anyhow::Result<Identity> {
		let id = UserId::new(self.sub).context("token subject")?;
		let name = self.name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| id.to_string());
		let mut identity = Identity::new(id, name).with_admin(self.admin);
		if let Some(until) = self.sudo_until_ms {
			identity = identity.with_sudo_until(until);
		}
		Ok(identity)
	}
}

/// Verify a `v1.<claims>.<signature>` token and return its claims.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now_secs = u64::try_from(unix_ms_now() / 1000).unwrap_or_default();
	if claims.exp <= now_secs {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Issue a token for `claims`. Used by tooling and tests.
#[allow(dead_code)]
pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("serialize token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Stateless verifier for HMAC-signed tokens.
#[derive(Debug, Clone)]
pub struct HmacTokenVerifier {
	secret: SecretString,
}

impl HmacTokenVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

#[async_trait]
impl IdentityVerifier for HmacTokenVerifier {
	async fn verify(&self, token: &str) -> anyhow::Result<Option<Identity>> {
		match verify_hmac_token(token, self.secret.expose()) {
			Ok(claims) => Ok(Some(claims.into_identity()?)),
			Err(e) => {
				debug!(error = %e, "hmac token rejected");
				Ok(None)
			}
		}
	}
}

/// Fixed token table. Used when no secret is configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
	tokens: HashMap<String, Identity>,
}

impl StaticVerifier {
	pub fn new() -> Self {
		Self::default()
	}

	#[allow(dead_code)]
	pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
		self.tokens.insert(token.into(), identity);
		self
	}
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
	async fn verify(&self, token: &str) -> anyhow::Result<Option<Identity>> {
		Ok(self.tokens.get(token).cloned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn claims(exp: u64) -> AuthClaims {
		AuthClaims {
			sub: "u1".into(),
			name: Some("Ann".into()),
			admin: true,
			sudo_until_ms: Some(42),
			exp,
		}
	}

	fn future_exp() -> u64 {
		(unix_ms_now() / 1000) as u64 + 3600
	}

	#[test]
	fn issued_tokens_verify() {
		let token = issue_hmac_token(&claims(future_exp()), "s3cret").unwrap();
		let got = verify_hmac_token(&token, "s3cret").unwrap();
		assert_eq!(got.sub, "u1");
		assert!(got.admin);
	}

	#[test]
	fn wrong_secret_and_expired_tokens_fail() {
		let token = issue_hmac_token(&claims(future_exp()), "s3cret").unwrap();
		assert!(verify_hmac_token(&token, "other").is_err());

		let expired = issue_hmac_token(&claims(1), "s3cret").unwrap();
		assert!(verify_hmac_token(&expired, "s3cret").is_err());

		assert!(verify_hmac_token("v2.a.b", "s3cret").is_err());
	}

	#[tokio::test]
	async fn hmac_verifier_maps_claims_to_identity() {
		let verifier = HmacTokenVerifier::new(SecretString::new("k"));
		let token = issue_hmac_token(&claims(future_exp()), "k").unwrap();

		let identity = verifier.verify(&token).await.unwrap().expect("identity");
		assert_eq!(identity.id.as_str(), "u1");
		assert_eq!(identity.name, "Ann");
		assert!(identity.admin);
		assert_eq!(identity.sudo_until_ms, Some(42));

		assert_eq!(verifier.verify("garbage").await.unwrap(), None);
	}

	#[tokio::test]
	async fn static_verifier_looks_up_tokens() {
		let ann = Identity::new(UserId::new("ann").unwrap(), "Ann");
		let verifier = StaticVerifier::new().with_token("t-ann", ann.clone());
		assert_eq!(verifier.verify("t-ann").await.unwrap(), Some(ann));
		assert_eq!(verifier.verify("t-bob").await.unwrap(), None);
	}
}
