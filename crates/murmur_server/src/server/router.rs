#![forbid(unsafe_code)]

//! Declarative HTTP routing.
//!
//! Routes live in a segment trie. Each node has literal children and at most
//! one `*` child that captures a single segment into `ApiRequest::params`.
//! Every route declares its requirements (auth level, rate limits, body
//! shape) and `dispatch` enforces them before the handler runs.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt as _;
use hyper::{HeaderMap, Method, StatusCode};
use murmur_domain::{AuthLevel, Identity};
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::server::rate_limit::{RateLimiter, address_key, user_key};
use crate::util::time::unix_ms_now;

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone)]
pub struct ApiRequest {
	pub method: Method,
	pub path: String,
	pub query: HashMap<String, String>,
	pub headers: HeaderMap,
	pub cookies: HashMap<String, String>,
	pub body: Value,
	pub addr: IpAddr,
	pub identity: Option<Identity>,
	/// Credential the identity was resolved from.
	pub credential: Option<String>,
	/// Segments captured by wildcards, in path order.
	pub params: Vec<String>,
}

impl ApiRequest {
	pub fn new(method: Method, path: impl Into<String>) -> Self {
		Self {
			method,
			path: path.into(),
			query: HashMap::new(),
			headers: HeaderMap::new(),
			cookies: HashMap::new(),
			body: Value::Null,
			addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			identity: None,
			credential: None,
			params: Vec::new(),
		}
	}

	pub fn with_addr(mut self, addr: IpAddr) -> Self {
		self.addr = addr;
		self
	}

	pub fn with_identity(mut self, identity: Identity) -> Self {
		self.identity = Some(identity);
		self
	}

	pub fn with_body(mut self, body: Value) -> Self {
		self.body = body;
		self
	}

	pub fn param(&self, idx: usize) -> Option<&str> {
		self.params.get(idx).map(String::as_str)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
	pub status: StatusCode,
	pub body: Value,
	/// Seconds for a `Retry-After` header.
	pub retry_after_secs: Option<u64>,
	/// Methods for an `Allow` header.
	pub allow: Vec<Method>,
}

impl ApiResponse {
	pub fn new(status: StatusCode, body: Value) -> Self {
		Self {
			status,
			body,
			retry_after_secs: None,
			allow: Vec::new(),
		}
	}

	pub fn ok(body: Value) -> Self {
		Self::new(StatusCode::OK, body)
	}

	pub fn error(status: StatusCode, code: &str) -> Self {
		Self::new(status, json!({ "error": code }))
	}
}

/// Shallow JSON type of a body field.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
	String,
	Number,
	Bool,
	Array,
	Object,
}

impl FieldType {
	fn matches(self, v: &Value) -> bool {
		match self {
			FieldType::String => v.is_string(),
			FieldType::Number => v.is_number(),
			FieldType::Bool => v.is_boolean(),
			FieldType::Array => v.is_array(),
			FieldType::Object => v.is_object(),
		}
	}

	fn as_str(self) -> &'static str {
		match self {
			FieldType::String => "string",
			FieldType::Number => "number",
			FieldType::Bool => "bool",
			FieldType::Array => "array",
			FieldType::Object => "object",
		}
	}
}

/// Required top-level fields of a JSON object body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodySchema {
	fields: Vec<(String, FieldType)>,
}

impl BodySchema {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
		self.fields.push((name.into(), ty));
		self
	}

	pub fn check(&self, body: &Value) -> Result<(), String> {
		let Some(obj) = body.as_object() else {
			return Err("body must be a json object".to_string());
		};
		for (name, ty) in &self.fields {
			match obj.get(name) {
				Some(v) if ty.matches(v) => {}
				Some(_) => return Err(format!("field {name:?} must be a {}", ty.as_str())),
				None => return Err(format!("missing field {name:?}")),
			}
		}
		Ok(())
	}
}

/// What quota key a route is charged against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateKey {
	#[default]
	Address,
	/// The caller's user id, or the address when anonymous.
	Identity,
}

#[derive(Debug, Clone, Default)]
pub struct RouteRequirements {
	pub auth: AuthLevel,
	pub rate_limits: Vec<String>,
	pub rate_key: RateKey,
	pub body: Option<BodySchema>,
}

impl RouteRequirements {
	pub fn public() -> Self {
		Self::default()
	}

	pub fn user() -> Self {
		Self::with_auth(AuthLevel::User)
	}

	pub fn admin() -> Self {
		Self::with_auth(AuthLevel::Admin)
	}

	pub fn sudo() -> Self {
		Self::with_auth(AuthLevel::Sudo)
	}

	pub fn with_auth(auth: AuthLevel) -> Self {
		Self {
			auth,
			..Self::default()
		}
	}

	pub fn rate_limited(mut self, buckets: &[&str], key: RateKey) -> Self {
		self.rate_limits = buckets.iter().map(|b| b.to_string()).collect();
		self.rate_key = key;
		self
	}

	pub fn body(mut self, schema: BodySchema) -> Self {
		self.body = Some(schema);
		self
	}
}

#[async_trait]
pub trait RouteHandler: Send + Sync {
	async fn call(&self, req: ApiRequest) -> anyhow::Result<ApiResponse>;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
	F: Fn(ApiRequest) -> Fut + Send + Sync,
	Fut: Future<Output = anyhow::Result<ApiResponse>> + Send + 'static,
{
	async fn call(&self, req: ApiRequest) -> anyhow::Result<ApiResponse> {
		(self)(req).await
	}
}

struct Route {
	handler: Arc<dyn RouteHandler>,
	requirements: RouteRequirements,
}

#[derive(Default)]
struct Node {
	literal: HashMap<String, Node>,
	wildcard: Option<Box<Node>>,
	/// A route was registered ending at this node.
	exists: bool,
	routes: HashMap<Method, Route>,
}

enum Resolution<'a> {
	Found(&'a Route, Vec<String>),
	MethodNotAllowed(Vec<Method>),
	NotFound,
}

pub struct Router {
	root: Node,
	limiter: RateLimiter,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
	path.split('/').filter(|s| !s.is_empty())
}

impl Router {
	pub fn new(limiter: RateLimiter) -> Self {
		Self {
			root: Node::default(),
			limiter,
		}
	}

	/// Register `handler` for `method` on `path`. A `*` segment matches any
	/// single segment.
	pub fn add_route<H>(&mut self, method: Method, path: &str, handler: H, requirements: RouteRequirements)
	where
		H: RouteHandler + 'static,
	{
		let mut node = &mut self.root;
		for seg in segments(path) {
			node = if seg == WILDCARD {
				node.wildcard.get_or_insert_with(Box::default).as_mut()
			} else {
				node.literal.entry(seg.to_string()).or_default()
			};
		}

		node.exists = true;
		let replaced = node
			.routes
			.insert(
				method.clone(),
				Route {
					handler: Arc::new(handler),
					requirements,
				},
			)
			.is_some();
		if replaced {
			warn!(%method, path, "route registered twice; replacing handler");
		}
	}

	#[allow(dead_code)]
	pub fn route<H>(mut self, method: Method, path: &str, handler: H, requirements: RouteRequirements) -> Self
	where
		H: RouteHandler + 'static,
	{
		self.add_route(method, path, handler, requirements);
		self
	}

	fn resolve(&self, method: &Method, path: &str) -> Resolution<'_> {
		let mut node = &self.root;
		let mut params = Vec::new();

		for seg in segments(path) {
			node = match (node.literal.get(seg), node.wildcard.as_deref()) {
				(Some(next), _) => next,
				(None, Some(next)) => {
					params.push(seg.to_string());
					next
				}
				(None, None) => return Resolution::NotFound,
			};
		}

		if !node.exists {
			return Resolution::NotFound;
		}

		match node.routes.get(method) {
			Some(route) => Resolution::Found(route, params),
			None => {
				let mut allow: Vec<Method> = node.routes.keys().cloned().collect();
				allow.sort_by(|a, b| a.as_str().cmp(b.as_str()));
				Resolution::MethodNotAllowed(allow)
			}
		}
	}

	pub async fn dispatch(&self, mut req: ApiRequest) -> ApiResponse {
		let (route, params) = match self.resolve(&req.method, &req.path) {
			Resolution::Found(route, params) => (route, params),
			Resolution::MethodNotAllowed(allow) => {
				let mut resp = ApiResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed");
				resp.allow = allow;
				return resp;
			}
			Resolution::NotFound => return ApiResponse::error(StatusCode::NOT_FOUND, "not_found"),
		};
		req.params = params;

		if let Err(resp) = check_auth(route.requirements.auth, req.identity.as_ref(), unix_ms_now()) {
			return resp;
		}

		if let Err(resp) = self.check_rate_limits(&route.requirements, &req) {
			return resp;
		}

		if let Some(schema) = &route.requirements.body
			&& let Err(detail) = schema.check(&req.body)
		{
			let mut resp = ApiResponse::error(StatusCode::BAD_REQUEST, "invalid_body");
			resp.body["detail"] = Value::String(detail);
			return resp;
		}

		let method = req.method.clone();
		let path = req.path.clone();
		match AssertUnwindSafe(route.handler.call(req)).catch_unwind().await {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => {
				error!(%method, %path, error = %e, "route handler failed");
				ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
			}
			Err(_) => {
				error!(%method, %path, "route handler panicked");
				ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
			}
		}
	}

	fn check_rate_limits(&self, requirements: &RouteRequirements, req: &ApiRequest) -> Result<(), ApiResponse> {
		if requirements.rate_limits.is_empty() {
			return Ok(());
		}

		let key = match (requirements.rate_key, req.identity.as_ref()) {
			(RateKey::Identity, Some(identity)) => user_key(identity.id.as_str()),
			_ => address_key(req.addr),
		};
		let bypass = req.identity.as_ref().is_some_and(|i| i.admin);
		let buckets = requirements.rate_limits.as_slice();

		match self.limiter.consume2(buckets, &key, bypass, 1) {
			Ok(true) => Ok(()),
			Ok(false) => {
				metrics::counter!("murmur_rate_limited_total", "scope" => "http").increment(1);
				let retry_after_ms = self.limiter.max_retry_after(buckets, &key).unwrap_or(0);
				let mut resp = ApiResponse::new(
					StatusCode::TOO_MANY_REQUESTS,
					json!({ "error": "rate_limited", "retry_after_ms": retry_after_ms }),
				);
				resp.retry_after_secs = Some(crate::util::time::retry_after_secs(retry_after_ms));
				Err(resp)
			}
			Err(e) => {
				error!(path = %req.path, error = %e, "route references a missing rate limit bucket");
				Err(ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error"))
			}
		}
	}
}

fn check_auth(required: AuthLevel, identity: Option<&Identity>, now_ms: i64) -> Result<(), ApiResponse> {
	if required == AuthLevel::None {
		return Ok(());
	}

	let Some(identity) = identity else {
		return Err(ApiResponse::error(StatusCode::UNAUTHORIZED, "unauthorized"));
	};

	match required {
		AuthLevel::None | AuthLevel::User => Ok(()),
		AuthLevel::Admin if identity.admin => Ok(()),
		AuthLevel::Sudo if identity.admin && identity.is_sudo_active(now_ms) => Ok(()),
		AuthLevel::Sudo if identity.admin => Err(ApiResponse::error(StatusCode::FORBIDDEN, "sudo_required")),
		AuthLevel::Admin | AuthLevel::Sudo => Err(ApiResponse::error(StatusCode::FORBIDDEN, "forbidden")),
	}
}
