#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::rate_limit::{API_BUCKET, AUTHORIZE_BUCKET, OverflowPolicy, PACKET_BUCKET, PACKET_MINUTE_BUCKET};

/// Default config path: `~/.murmur/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".murmur").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// A string that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Which built-in packet handler serves application packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketHandlerKind {
	#[default]
	Relay,
	Null,
}

impl std::str::FromStr for PacketHandlerKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"relay" => Ok(PacketHandlerKind::Relay),
			"null" => Ok(PacketHandlerKind::Null),
			other => Err(format!("unknown packet handler {other:?} (expected relay|null)")),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen endpoint (`http://host:port`). The CLI `--bind` wins over this.
	pub bind: Option<String>,
	/// Path that accepts websocket upgrades.
	pub gateway_path: String,
	/// Grace period for an unauthenticated connection.
	pub auth_timeout: Duration,
	pub max_frame_payload_bytes: usize,
	pub max_http_body_bytes: usize,
	/// Per-connection outbound frame queue.
	pub outbound_queue_capacity: usize,
	/// Honor `X-Forwarded-For`.
	pub trust_proxy: bool,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	pub packet_handler: PacketHandlerKind,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: None,
			gateway_path: "/gateway".to_string(),
			auth_timeout: Duration::from_secs(10),
			max_frame_payload_bytes: murmur_protocol::DEFAULT_MAX_PAYLOAD,
			max_http_body_bytes: 64 * 1024,
			outbound_queue_capacity: 256,
			trust_proxy: false,
			metrics_bind: None,
			auth_hmac_secret: None,
			packet_handler: PacketHandlerKind::default(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
	pub overflow_policy: OverflowPolicy,
	/// How often expired windows are reset in the background.
	pub reset_tick: Duration,
	pub buckets: Vec<BucketSettings>,
}

impl Default for RateLimitSettings {
	fn default() -> Self {
		Self {
			overflow_policy: OverflowPolicy::default(),
			reset_tick: Duration::from_secs(1),
			buckets: default_buckets(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
	pub id: String,
	pub capacity: u32,
	pub window: Duration,
}

impl BucketSettings {
	fn new(id: &str, capacity: u32, window: Duration) -> Self {
		Self {
			id: id.to_string(),
			capacity,
			window,
		}
	}
}

/// Buckets the gateway itself consumes from.
pub fn default_buckets() -> Vec<BucketSettings> {
	vec![
		BucketSettings::new(AUTHORIZE_BUCKET, 5, Duration::from_secs(60)),
		BucketSettings::new(PACKET_BUCKET, 30, Duration::from_secs(15)),
		BucketSettings::new(PACKET_MINUTE_BUCKET, 90, Duration::from_secs(60)),
		BucketSettings::new(API_BUCKET, 120, Duration::from_secs(60)),
	]
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	rate_limit: FileRateLimitSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	gateway_path: Option<String>,
	auth_timeout_ms: Option<u64>,
	max_frame_payload_bytes: Option<usize>,
	max_http_body_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	trust_proxy: Option<bool>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	packet_handler: Option<PacketHandlerKind>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRateLimitSettings {
	overflow_policy: Option<OverflowPolicy>,
	reset_tick_ms: Option<u64>,
	#[serde(default)]
	buckets: Vec<FileBucket>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileBucket {
	id: String,
	capacity: u32,
	window_ms: u64,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerSettings::default();

		let gateway_path = match file.server.gateway_path.filter(|s| !s.trim().is_empty()) {
			Some(p) => normalize_path(&p)?,
			None => defaults.gateway_path,
		};

		let mut buckets = default_buckets();
		for b in file.rate_limit.buckets {
			let id = b.id.trim().to_string();
			if id.is_empty() {
				return Err(anyhow!("rate_limit.buckets entry has an empty id"));
			}
			if b.capacity == 0 || b.window_ms == 0 {
				return Err(anyhow!("rate_limit bucket {id:?} needs capacity > 0 and window_ms > 0"));
			}
			let bucket = BucketSettings {
				id,
				capacity: b.capacity,
				window: Duration::from_millis(b.window_ms),
			};
			match buckets.iter_mut().find(|existing| existing.id == bucket.id) {
				Some(existing) => *existing = bucket,
				None => buckets.push(bucket),
			}
		}

		Ok(Self {
			server: ServerSettings {
				bind: file.server.bind.filter(|s| !s.trim().is_empty()),
				gateway_path,
				auth_timeout: file
					.server
					.auth_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.auth_timeout),
				max_frame_payload_bytes: file
					.server
					.max_frame_payload_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_payload_bytes),
				max_http_body_bytes: file
					.server
					.max_http_body_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_http_body_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				trust_proxy: file.server.trust_proxy.unwrap_or(false),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				packet_handler: file.server.packet_handler.unwrap_or_default(),
			},
			rate_limit: RateLimitSettings {
				overflow_policy: file.rate_limit.overflow_policy.unwrap_or_default(),
				reset_tick: file
					.rate_limit
					.reset_tick_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(Duration::from_secs(1)),
				buckets,
			},
		})
	}
}

fn normalize_path(p: &str) -> anyhow::Result<String> {
	let p = p.trim();
	if p.contains('?') || p.contains('#') {
		return Err(anyhow!("gateway_path must be a plain path: {p}"));
	}
	let trimmed = p.trim_end_matches('/');
	if trimmed.is_empty() {
		return Err(anyhow!("gateway_path must not be the root path"));
	}
	if trimmed.starts_with('/') {
		Ok(trimmed.to_string())
	} else {
		Ok(format!("/{trimmed}"))
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("MURMUR_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = Some(v);
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MURMUR_GATEWAY_PATH") {
		match normalize_path(&v) {
			Ok(path) => {
				info!(%path, "server config: gateway_path overridden by env");
				cfg.server.gateway_path = path;
			}
			Err(e) => warn!(error = %e, "server config: ignoring MURMUR_GATEWAY_PATH"),
		}
	}

	if let Ok(v) = std::env::var("MURMUR_AUTH_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
		&& ms > 0
	{
		cfg.server.auth_timeout = Duration::from_millis(ms);
		info!(ms, "server config: auth_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("MURMUR_MAX_FRAME_PAYLOAD_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_payload_bytes = bytes;
		info!(bytes, "server config: max_frame_payload_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("MURMUR_MAX_HTTP_BODY_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_http_body_bytes = bytes;
		info!(bytes, "server config: max_http_body_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("MURMUR_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("MURMUR_TRUST_PROXY")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.trust_proxy = enabled;
		info!(enabled, "server config: trust_proxy overridden by env");
	}

	if let Ok(v) = std::env::var("MURMUR_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MURMUR_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MURMUR_PACKET_HANDLER") {
		match v.parse::<PacketHandlerKind>() {
			Ok(kind) => {
				cfg.server.packet_handler = kind;
				info!(?kind, "server config: packet_handler overridden by env");
			}
			Err(e) => warn!(error = %e, "server config: ignoring MURMUR_PACKET_HANDLER"),
		}
	}

	if let Ok(v) = std::env::var("MURMUR_RATE_LIMIT_OVERFLOW_POLICY") {
		match v.parse::<OverflowPolicy>() {
			Ok(policy) => {
				cfg.rate_limit.overflow_policy = policy;
				info!(?policy, "rate limit: overflow_policy overridden by env");
			}
			Err(e) => warn!(error = %e, "rate limit: ignoring MURMUR_RATE_LIMIT_OVERFLOW_POLICY"),
		}
	}

	if let Ok(v) = std::env::var("MURMUR_RATE_LIMIT_RESET_TICK_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
		&& ms > 0
	{
		cfg.rate_limit.reset_tick = Duration::from_millis(ms);
		info!(ms, "rate limit: reset_tick overridden by env");
	}
}
