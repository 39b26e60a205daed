#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{
	AUTHORIZATION, CONNECTION, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER,
	SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use murmur_protocol::{UpgradeRequest, derive_accept_key};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::server::registry::Registry;
use crate::server::router::{ApiRequest, ApiResponse, Router};

/// Cookie carrying a session credential.
pub const SESSION_COOKIE: &str = "session";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

#[derive(Debug, Clone)]
pub struct HttpSettings {
	pub gateway_path: String,
	pub max_body_bytes: usize,
	pub trust_proxy: bool,
}

#[derive(Clone)]
pub struct HttpState {
	pub registry: Registry,
	pub router: Arc<Router>,
	pub settings: Arc<HttpSettings>,
}

/// Accept loop: one task per TCP connection, upgrades enabled.
pub async fn serve(listener: TcpListener, state: HttpState) -> anyhow::Result<()> {
	loop {
		let (stream, addr) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, addr, state.clone()));
			if let Err(err) = http1::Builder::new()
				.serve_connection(io, service)
				.with_upgrades()
				.await
			{
				debug!(%addr, error = %err, "http connection error");
			}
		});
	}
}

async fn handle_request(
	req: Request<Incoming>,
	peer: SocketAddr,
	state: HttpState,
) -> Result<Response<Full<Bytes>>, Infallible> {
	metrics::counter!("murmur_http_requests_total").increment(1);

	let client_ip = client_ip(req.headers(), peer.ip(), state.settings.trust_proxy);

	if req.uri().path() == state.settings.gateway_path {
		return Ok(upgrade(req, SocketAddr::new(client_ip, peer.port()), &state));
	}

	let api_req = match into_api_request(req, client_ip, &state).await {
		Ok(r) => r,
		Err(resp) => return Ok(into_response(resp)),
	};

	let resp = state.router.dispatch(api_req).await;
	Ok(into_response(resp))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
	headers.get(name).and_then(|v| v.to_str().ok())
}

fn upgrade(mut req: Request<Incoming>, addr: SocketAddr, state: &HttpState) -> Response<Full<Bytes>> {
	let key = {
		let headers = req.headers();
		let upgrade_req = UpgradeRequest {
			method: req.method().as_str(),
			upgrade: header_str(headers, &UPGRADE),
			connection: header_str(headers, &CONNECTION),
			version: header_str(headers, &SEC_WEBSOCKET_VERSION),
			key: header_str(headers, &SEC_WEBSOCKET_KEY),
		};
		match upgrade_req.validate() {
			Ok(key) => key.to_string(),
			Err(e) => {
				debug!(%addr, error = %e, "rejected websocket upgrade");
				return plain(StatusCode::BAD_REQUEST, "bad websocket upgrade");
			}
		}
	};

	let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
		return plain(StatusCode::INTERNAL_SERVER_ERROR, "");
	};

	let on_upgrade = hyper::upgrade::on(&mut req);
	let registry = state.registry.clone();
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				registry.accept(TokioIo::new(upgraded), addr).await;
			}
			Err(e) => debug!(%addr, error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
	let headers = resp.headers_mut();
	headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
	headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
	resp
}

async fn into_api_request(req: Request<Incoming>, addr: IpAddr, state: &HttpState) -> Result<ApiRequest, ApiResponse> {
	let (parts, body) = req.into_parts();

	let collected = Limited::new(body, state.settings.max_body_bytes).collect().await;
	let bytes = match collected {
		Ok(c) => c.to_bytes(),
		Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
			return Err(ApiResponse::error(StatusCode::PAYLOAD_TOO_LARGE, "body_too_large"));
		}
		Err(e) => {
			debug!(error = %e, "failed to read request body");
			return Err(ApiResponse::error(StatusCode::BAD_REQUEST, "unreadable_body"));
		}
	};

	let body = if bytes.iter().all(u8::is_ascii_whitespace) {
		Value::Null
	} else {
		serde_json::from_slice::<Value>(&bytes).map_err(|_| ApiResponse::error(StatusCode::BAD_REQUEST, "invalid_json"))?
	};

	let query = parts.uri.query().map(parse_query).unwrap_or_default();
	let cookies = parse_cookies(&parts.headers);

	let credential = bearer_token(&parts.headers).or_else(|| cookies.get(SESSION_COOKIE).cloned());
	let identity = match credential.as_deref() {
		Some(token) => match state.registry.verifier().verify(token).await {
			Ok(identity) => identity,
			Err(e) => {
				warn!(error = %e, "identity verifier failed for http request");
				None
			}
		},
		None => None,
	};

	let mut req = ApiRequest::new(parts.method, parts.uri.path())
		.with_addr(addr)
		.with_body(body);
	req.query = query;
	req.headers = parts.headers;
	req.cookies = cookies;
	if let Some(identity) = identity {
		req.credential = credential;
		req = req.with_identity(identity);
	}
	Ok(req)
}

fn into_response(resp: ApiResponse) -> Response<Full<Bytes>> {
	let body = if resp.body.is_null() {
		Bytes::new()
	} else {
		Bytes::from(resp.body.to_string())
	};

	let mut out = Response::new(Full::new(body));
	*out.status_mut() = resp.status;
	let headers = out.headers_mut();
	if !resp.body.is_null() {
		headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	}
	if let Some(secs) = resp.retry_after_secs {
		headers.insert(RETRY_AFTER, HeaderValue::from(secs));
	}
	if !resp.allow.is_empty() {
		let allow = resp.allow.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ");
		if let Ok(v) = HeaderValue::from_str(&allow) {
			headers.insert(hyper::header::ALLOW, v);
		}
	}
	out
}

fn plain(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(text.as_bytes())));
	*resp.status_mut() = status;
	resp
}

fn client_ip(headers: &HeaderMap, peer: IpAddr, trust_proxy: bool) -> IpAddr {
	if !trust_proxy {
		return peer;
	}
	header_str(headers, &X_FORWARDED_FOR)
		.and_then(|v| v.split(',').next())
		.and_then(|first| first.trim().parse().ok())
		.unwrap_or(peer)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
	let value = header_str(headers, &AUTHORIZATION)?;
	let (scheme, token) = value.trim().split_once(' ')?;
	if !scheme.eq_ignore_ascii_case("bearer") {
		return None;
	}
	let token = token.trim();
	(!token.is_empty()).then(|| token.to_string())
}

/// Parse `a=1&b=two%20words`. Later keys win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
	query
		.split('&')
		.filter(|pair| !pair.is_empty())
		.map(|pair| match pair.split_once('=') {
			Some((k, v)) => (percent_decode(k), percent_decode(v)),
			None => (percent_decode(pair), String::new()),
		})
		.collect()
}

/// Parse every `Cookie` header. The first occurrence of a name wins.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
	let mut out = HashMap::new();
	for value in headers.get_all(COOKIE) {
		let Ok(value) = value.to_str() else {
			continue;
		};
		for pair in value.split(';') {
			if let Some((name, val)) = pair.split_once('=') {
				let name = name.trim();
				if !name.is_empty() {
					out.entry(name.to_string())
						.or_insert_with(|| val.trim().trim_matches('"').to_string());
				}
			}
		}
	}
	out
}

fn percent_decode(s: &str) -> String {
	let bytes = s.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'+' => out.push(b' '),
			b'%' => match (
				bytes.get(i + 1).copied().and_then(hex),
				bytes.get(i + 2).copied().and_then(hex),
			) {
				(Some(hi), Some(lo)) => {
					out.push(hi << 4 | lo);
					i += 2;
				}
				_ => out.push(b'%'),
			},
			b => out.push(b),
		}
		i += 1;
	}
	String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
	match b {
		b'0'..=b'9' => Some(b - b'0'),
		b'a'..=b'f' => Some(b - b'a' + 10),
		b'A'..=b'F' => Some(b - b'A' + 10),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn query_pairs_are_decoded() {
		let q = parse_query("a=1&name=two%20words&flag&plus=a+b&a=2");
		assert_eq!(q["a"], "2");
		assert_eq!(q["name"], "two words");
		assert_eq!(q["flag"], "");
		assert_eq!(q["plus"], "a b");
	}

	#[test]
	fn truncated_escape_is_kept_literally() {
		assert_eq!(parse_query("x=100%")["x"], "100%");
		assert_eq!(parse_query("x=%4")["x"], "%4");
	}

	#[test]
	fn cookies_from_multiple_headers() {
		let mut headers = HeaderMap::new();
		headers.append(COOKIE, HeaderValue::from_static("session=abc; theme=\"dark\""));
		headers.append(COOKIE, HeaderValue::from_static("session=ignored; lang=en"));
		let cookies = parse_cookies(&headers);
		assert_eq!(cookies["session"], "abc");
		assert_eq!(cookies["theme"], "dark");
		assert_eq!(cookies["lang"], "en");
	}

	#[test]
	fn bearer_token_requires_scheme() {
		let mut headers = HeaderMap::new();
		headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t-1"));
		assert_eq!(bearer_token(&headers).as_deref(), Some("t-1"));

		headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
		assert_eq!(bearer_token(&headers), None);
	}

	#[test]
	fn forwarded_for_only_when_trusted() {
		let peer: IpAddr = "10.0.0.1".parse().unwrap();
		let mut headers = HeaderMap::new();
		headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7, 10.0.0.1"));

		assert_eq!(client_ip(&headers, peer, false), peer);
		assert_eq!(client_ip(&headers, peer, true), "203.0.113.7".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn responses_carry_retry_after_and_allow() {
		let mut resp = ApiResponse::error(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
		resp.retry_after_secs = Some(3);
		let out = into_response(resp);
		assert_eq!(out.status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(out.headers()[RETRY_AFTER], "3");

		let mut resp = ApiResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed");
		resp.allow = vec![hyper::Method::GET, hyper::Method::POST];
		let out = into_response(resp);
		assert_eq!(out.headers()[hyper::header::ALLOW], "GET, POST");
	}
}
