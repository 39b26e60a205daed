#![forbid(unsafe_code)]

//! Registry and limiter operations exposed over HTTP.

use std::net::IpAddr;

use hyper::{Method, StatusCode};
use murmur_domain::{ConnId, UserId};
use murmur_protocol::ServerPacket;
use serde_json::json;
use tracing::info;

use crate::server::rate_limit::{API_BUCKET, RateLimitError, RateLimiter};
use crate::server::registry::Registry;
use crate::server::router::{ApiRequest, ApiResponse, BodySchema, FieldType, RateKey, RouteRequirements, Router};

pub fn register(router: &mut Router, registry: Registry, limiter: RateLimiter) {
	let r = registry.clone();
	router.add_route(
		Method::GET,
		"/api/presence",
		move |req: ApiRequest| presence(r.clone(), req),
		RouteRequirements::user().rate_limited(&[API_BUCKET], RateKey::Identity),
	);

	let r = registry.clone();
	router.add_route(
		Method::POST,
		"/api/logout",
		move |req: ApiRequest| logout(r.clone(), req),
		RouteRequirements::user(),
	);

	let r = registry.clone();
	router.add_route(
		Method::GET,
		"/api/admin/connections",
		move |req: ApiRequest| connections(r.clone(), req),
		RouteRequirements::admin(),
	);

	let r = registry.clone();
	router.add_route(
		Method::POST,
		"/api/admin/connections/*/close",
		move |req: ApiRequest| close_connection(r.clone(), req),
		RouteRequirements::admin(),
	);

	let r = registry.clone();
	router.add_route(
		Method::POST,
		"/api/admin/users/*/disconnect",
		move |req: ApiRequest| disconnect_user(r.clone(), req),
		RouteRequirements::admin().rate_limited(&[API_BUCKET], RateKey::Identity),
	);

	let r = registry;
	router.add_route(
		Method::POST,
		"/api/admin/reload",
		move |req: ApiRequest| reload_address(r.clone(), req),
		RouteRequirements::sudo().body(BodySchema::new().field("address", FieldType::String)),
	);

	router.add_route(
		Method::POST,
		"/api/admin/rate-limits/*/reset",
		move |req: ApiRequest| reset_bucket(limiter.clone(), req),
		RouteRequirements::sudo(),
	);
}

async fn presence(registry: Registry, _req: ApiRequest) -> anyhow::Result<ApiResponse> {
	let users = registry.presence_snapshot().await;
	Ok(ApiResponse::ok(json!({ "users": users })))
}

async fn logout(registry: Registry, req: ApiRequest) -> anyhow::Result<ApiResponse> {
	let closed = match req.credential.as_deref() {
		Some(credential) => registry.close_by_credential(credential).await,
		None => 0,
	};
	Ok(ApiResponse::ok(json!({ "closed": closed })))
}

async fn connections(registry: Registry, _req: ApiRequest) -> anyhow::Result<ApiResponse> {
	let connections = registry.connections().await;
	let authorized = connections.iter().filter(|c| c.user.is_some()).count();
	Ok(ApiResponse::ok(json!({
		"total": connections.len(),
		"authorized": authorized,
		"connections": connections,
	})))
}

async fn close_connection(registry: Registry, req: ApiRequest) -> anyhow::Result<ApiResponse> {
	let Some(conn_id) = req.param(0).and_then(|raw| raw.parse::<u64>().ok()).map(ConnId) else {
		return Ok(ApiResponse::error(StatusCode::BAD_REQUEST, "invalid_connection_id"));
	};

	if !registry.close(conn_id).await {
		return Ok(ApiResponse::error(StatusCode::NOT_FOUND, "unknown_connection"));
	}
	info!(%conn_id, "admin closed connection");
	Ok(ApiResponse::ok(json!({ "closed": conn_id })))
}

async fn disconnect_user(registry: Registry, req: ApiRequest) -> anyhow::Result<ApiResponse> {
	let Some(user) = req.param(0).and_then(|raw| UserId::new(raw).ok()) else {
		return Ok(ApiResponse::error(StatusCode::BAD_REQUEST, "invalid_user_id"));
	};

	let closed = registry.close_by_identity(&user).await;
	if let Some(admin) = &req.identity {
		info!(admin = %admin.id, user = %user, closed, "admin disconnected user");
	}
	Ok(ApiResponse::ok(json!({ "closed": closed })))
}

async fn reload_address(registry: Registry, req: ApiRequest) -> anyhow::Result<ApiResponse> {
	let Some(Ok(ip)) = req.body["address"].as_str().map(|a| a.trim().parse::<IpAddr>()) else {
		return Ok(ApiResponse::error(StatusCode::BAD_REQUEST, "invalid_address"));
	};

	let frame = ServerPacket::Reload.encode()?;
	let notified = registry.broadcast_to_address(ip, frame).await;
	info!(%ip, notified, "reload requested");
	Ok(ApiResponse::ok(json!({ "notified": notified })))
}

async fn reset_bucket(limiter: RateLimiter, req: ApiRequest) -> anyhow::Result<ApiResponse> {
	let bucket = req.param(0).unwrap_or_default();
	match limiter.reset(bucket) {
		Ok(()) => {
			info!(bucket, "rate limit bucket reset");
			Ok(ApiResponse::ok(json!({ "reset": bucket })))
		}
		Err(RateLimitError::UnknownBucket(_)) => Ok(ApiResponse::error(StatusCode::NOT_FOUND, "unknown_bucket")),
		Err(e) => Err(e.into()),
	}
}
