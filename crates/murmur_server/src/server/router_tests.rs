#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::{Method, StatusCode};
use murmur_domain::{Identity, UserId};
use murmur_protocol::ServerPacket;
use serde_json::{Value, json};

use crate::handlers::null::NullPacketHandler;
use crate::server::auth::StaticVerifier;
use crate::server::connection::ConnectionSettings;
use crate::server::rate_limit::{API_BUCKET, RateLimiter, address_key};
use crate::server::registry::Registry;
use crate::server::router::{ApiRequest, ApiResponse, BodySchema, FieldType, RateKey, RouteRequirements, Router};
use crate::util::time::unix_ms_now;

async fn echo_params(req: ApiRequest) -> anyhow::Result<ApiResponse> {
	Ok(ApiResponse::ok(json!({ "params": req.params })))
}

async fn tagged(tag: &'static str) -> anyhow::Result<ApiResponse> {
	Ok(ApiResponse::ok(json!({ "tag": tag })))
}

async fn fails(_req: ApiRequest) -> anyhow::Result<ApiResponse> {
	anyhow::bail!("store unavailable")
}

async fn panics(_req: ApiRequest) -> anyhow::Result<ApiResponse> {
	panic!("handler exploded")
}

fn user(id: &str) -> Identity {
	Identity::new(UserId::new(id).expect("valid UserId"), id.to_uppercase())
}

fn admin(id: &str) -> Identity {
	user(id).with_admin(true)
}

fn sudo(id: &str) -> Identity {
	admin(id).with_sudo_until(unix_ms_now() + 60_000)
}

fn limiter_with(buckets: &[(&str, u32)]) -> RateLimiter {
	let limiter = RateLimiter::default();
	for (id, capacity) in buckets {
		limiter.create(id, *capacity, Duration::from_secs(60)).unwrap();
	}
	limiter
}

fn req(method: Method, path: &str) -> ApiRequest {
	ApiRequest::new(method, path)
}

#[tokio::test]
async fn wildcard_segment_is_captured() {
	let router = Router::new(RateLimiter::default()).route(
		Method::POST,
		"/api/admin/users/*/disconnect",
		echo_params,
		RouteRequirements::public(),
	);

	let resp = router.dispatch(req(Method::POST, "/api/admin/users/42/disconnect")).await;
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(resp.body["params"], json!(["42"]));
}

#[tokio::test]
async fn literal_segment_wins_over_wildcard() {
	let router = Router::new(RateLimiter::default())
		.route(Method::GET, "/items/*", |_req: ApiRequest| tagged("wild"), RouteRequirements::public())
		.route(Method::GET, "/items/special", |_req: ApiRequest| tagged("literal"), RouteRequirements::public());

	let resp = router.dispatch(req(Method::GET, "/items/special")).await;
	assert_eq!(resp.body["tag"], "literal");

	let resp = router.dispatch(req(Method::GET, "/items/other")).await;
	assert_eq!(resp.body["tag"], "wild");
}

#[tokio::test]
async fn trailing_and_repeated_slashes_are_ignored() {
	let router =
		Router::new(RateLimiter::default()).route(Method::GET, "/a/b", echo_params, RouteRequirements::public());

	assert_eq!(router.dispatch(req(Method::GET, "/a/b/")).await.status, StatusCode::OK);
	assert_eq!(router.dispatch(req(Method::GET, "//a//b")).await.status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_path_is_404_and_wrong_method_is_405() {
	let router = Router::new(RateLimiter::default())
		.route(Method::POST, "/api/things/*", echo_params, RouteRequirements::public())
		.route(Method::DELETE, "/api/things/*", echo_params, RouteRequirements::public());

	let resp = router.dispatch(req(Method::GET, "/api/things/1")).await;
	assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
	assert_eq!(resp.allow, vec![Method::DELETE, Method::POST]);

	let resp = router.dispatch(req(Method::GET, "/api/things")).await;
	assert_eq!(resp.status, StatusCode::NOT_FOUND);

	let resp = router.dispatch(req(Method::GET, "/api/things/1/extra")).await;
	assert_eq!(resp.status, StatusCode::NOT_FOUND);
	assert!(resp.allow.is_empty());
}

#[tokio::test]
async fn auth_levels_are_enforced() {
	let router = Router::new(RateLimiter::default())
		.route(Method::GET, "/u", echo_params, RouteRequirements::user())
		.route(Method::GET, "/a", echo_params, RouteRequirements::admin())
		.route(Method::GET, "/s", echo_params, RouteRequirements::sudo());

	let status = |resp: ApiResponse| (resp.status, resp.body["error"].clone());

	assert_eq!(
		status(router.dispatch(req(Method::GET, "/u")).await),
		(StatusCode::UNAUTHORIZED, json!("unauthorized"))
	);
	assert_eq!(
		router.dispatch(req(Method::GET, "/u").with_identity(user("ann"))).await.status,
		StatusCode::OK
	);

	assert_eq!(
		status(router.dispatch(req(Method::GET, "/a").with_identity(user("ann"))).await),
		(StatusCode::FORBIDDEN, json!("forbidden"))
	);
	assert_eq!(
		router.dispatch(req(Method::GET, "/a").with_identity(admin("root"))).await.status,
		StatusCode::OK
	);

	assert_eq!(
		status(router.dispatch(req(Method::GET, "/s").with_identity(user("ann"))).await),
		(StatusCode::FORBIDDEN, json!("forbidden"))
	);
	assert_eq!(
		status(router.dispatch(req(Method::GET, "/s").with_identity(admin("root"))).await),
		(StatusCode::FORBIDDEN, json!("sudo_required"))
	);
	let expired = admin("root").with_sudo_until(unix_ms_now() - 1);
	assert_eq!(
		status(router.dispatch(req(Method::GET, "/s").with_identity(expired)).await),
		(StatusCode::FORBIDDEN, json!("sudo_required"))
	);
	assert_eq!(
		router.dispatch(req(Method::GET, "/s").with_identity(sudo("root"))).await.status,
		StatusCode::OK
	);
}

#[tokio::test]
async fn route_quota_returns_429_with_retry_after() {
	let limiter = limiter_with(&[("tiny", 1)]);
	let router = Router::new(limiter.clone()).route(
		Method::GET,
		"/limited",
		echo_params,
		RouteRequirements::public().rate_limited(&["tiny"], RateKey::Address),
	);
	let from = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));

	let first = router.dispatch(req(Method::GET, "/limited").with_addr(from)).await;
	assert_eq!(first.status, StatusCode::OK);

	let second = router.dispatch(req(Method::GET, "/limited").with_addr(from)).await;
	assert_eq!(second.status, StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(second.body["error"], "rate_limited");
	let retry_ms = second.body["retry_after_ms"].as_u64().unwrap();
	assert!(retry_ms > 0 && retry_ms <= 120_000, "retry_after_ms = {retry_ms}");
	let secs = second.retry_after_secs.unwrap();
	assert!((1..=120).contains(&secs), "retry_after_secs = {secs}");

	let other = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 6));
	assert_eq!(
		router.dispatch(req(Method::GET, "/limited").with_addr(other)).await.status,
		StatusCode::OK
	);
	assert_eq!(limiter.points("tiny", &address_key(from)).unwrap(), 2);
}

#[tokio::test]
async fn identity_keyed_quota_follows_the_user_not_the_address() {
	let limiter = limiter_with(&[("tiny", 1)]);
	let router = Router::new(limiter).route(
		Method::GET,
		"/limited",
		echo_params,
		RouteRequirements::user().rate_limited(&["tiny"], RateKey::Identity),
	);
	let a = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1));
	let b = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 2));

	let call = |ip: IpAddr, who: &str| req(Method::GET, "/limited").with_addr(ip).with_identity(user(who));

	assert_eq!(router.dispatch(call(a, "ann")).await.status, StatusCode::OK);
	assert_eq!(router.dispatch(call(b, "ann")).await.status, StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(router.dispatch(call(a, "bob")).await.status, StatusCode::OK);
}

#[tokio::test]
async fn admins_bypass_route_quotas() {
	let router = Router::new(limiter_with(&[("tiny", 1)])).route(
		Method::GET,
		"/limited",
		echo_params,
		RouteRequirements::admin().rate_limited(&["tiny"], RateKey::Identity),
	);

	for _ in 0..5 {
		let resp = router.dispatch(req(Method::GET, "/limited").with_identity(admin("root"))).await;
		assert_eq!(resp.status, StatusCode::OK);
	}
}

#[tokio::test]
async fn missing_bucket_is_an_internal_error() {
	let router = Router::new(RateLimiter::default()).route(
		Method::GET,
		"/limited",
		echo_params,
		RouteRequirements::public().rate_limited(&["nope"], RateKey::Address),
	);

	let resp = router.dispatch(req(Method::GET, "/limited")).await;
	assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn body_schema_is_checked_before_the_handler() {
	let router = Router::new(RateLimiter::default()).route(
		Method::POST,
		"/things",
		|req: ApiRequest| async move { anyhow::Ok(ApiResponse::ok(req.body)) },
		RouteRequirements::public().body(
			BodySchema::new()
				.field("name", FieldType::String)
				.field("count", FieldType::Number),
		),
	);

	let resp = router.dispatch(req(Method::POST, "/things")).await;
	assert_eq!(resp.status, StatusCode::BAD_REQUEST);
	assert_eq!(resp.body["error"], "invalid_body");

	let resp = router
		.dispatch(req(Method::POST, "/things").with_body(json!({ "name": "x" })))
		.await;
	assert_eq!(resp.status, StatusCode::BAD_REQUEST);
	assert_eq!(resp.body["detail"], "missing field \"count\"");

	let resp = router
		.dispatch(req(Method::POST, "/things").with_body(json!({ "name": 1, "count": 2 })))
		.await;
	assert_eq!(resp.body["detail"], "field \"name\" must be a string");

	let body = json!({ "name": "x", "count": 2, "extra": true });
	let resp = router.dispatch(req(Method::POST, "/things").with_body(body.clone())).await;
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(resp.body, body);
}

#[tokio::test]
async fn handler_failures_become_500() {
	let router = Router::new(RateLimiter::default())
		.route(Method::GET, "/fails", fails, RouteRequirements::public())
		.route(Method::GET, "/panics", panics, RouteRequirements::public());

	for path in ["/fails", "/panics"] {
		let resp = router.dispatch(req(Method::GET, path)).await;
		assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR, "{path}");
		assert_eq!(resp.body["error"], "internal_error");
	}
}

#[tokio::test]
async fn registering_twice_replaces_the_handler() {
	let router = Router::new(RateLimiter::default())
		.route(Method::GET, "/v", |_req: ApiRequest| tagged("old"), RouteRequirements::public())
		.route(Method::GET, "/v", |_req: ApiRequest| tagged("new"), RouteRequirements::public());

	assert_eq!(router.dispatch(req(Method::GET, "/v")).await.body["tag"], "new");
}

struct AdminFixture {
	router: Router,
	registry: Registry,
	limiter: RateLimiter,
}

fn admin_fixture() -> AdminFixture {
	let limiter = limiter_with(&[(API_BUCKET, 100)]);
	let registry = Registry::new(
		ConnectionSettings::default(),
		limiter.clone(),
		Arc::new(StaticVerifier::new()),
		Arc::new(NullPacketHandler),
	);
	let mut router = Router::new(limiter.clone());
	crate::server::admin::register(&mut router, registry.clone(), limiter.clone());
	AdminFixture {
		router,
		registry,
		limiter,
	}
}

fn peer(last: u8) -> SocketAddr {
	SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), 50_000)
}

#[tokio::test]
async fn admin_disconnect_closes_the_users_connections() {
	let f = admin_fixture();
	let ann = f.registry.register(peer(1)).await;
	let bob = f.registry.register(peer(2)).await;
	assert!(f.registry.bind_identity(ann.conn_id, user("ann"), "a".into()).await);
	assert!(f.registry.bind_identity(bob.conn_id, user("bob"), "b".into()).await);

	let resp = f
		.router
		.dispatch(req(Method::POST, "/api/admin/users/ann/disconnect").with_identity(admin("root")))
		.await;
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(resp.body["closed"], 1);
	assert!(*ann.close_rx.borrow());
	assert!(!*bob.close_rx.borrow());

	let resp = f
		.router
		.dispatch(req(Method::POST, "/api/admin/users/ann/disconnect").with_identity(user("bob")))
		.await;
	assert_eq!(resp.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_can_close_one_connection() {
	let f = admin_fixture();
	let reg = f.registry.register(peer(1)).await;
	let path = format!("/api/admin/connections/{}/close", reg.conn_id);

	let resp = f.router.dispatch(req(Method::POST, &path).with_identity(admin("root"))).await;
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(resp.body["closed"], reg.conn_id.0);
	assert!(*reg.close_rx.borrow());

	let resp = f
		.router
		.dispatch(req(Method::POST, "/api/admin/connections/999999/close").with_identity(admin("root")))
		.await;
	assert_eq!(resp.status, StatusCode::NOT_FOUND);

	let resp = f
		.router
		.dispatch(req(Method::POST, "/api/admin/connections/abc/close").with_identity(admin("root")))
		.await;
	assert_eq!(resp.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_reload_notifies_connections_from_address() {
	let f = admin_fixture();
	let mut target = f.registry.register(peer(9)).await;
	let mut bystander = f.registry.register(peer(10)).await;

	let resp = f
		.router
		.dispatch(
			req(Method::POST, "/api/admin/reload")
				.with_identity(sudo("root"))
				.with_body(json!({ "address": "192.0.2.9" })),
		)
		.await;
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(resp.body["notified"], 1);
	assert_eq!(target.outbound_rx.try_recv().unwrap(), ServerPacket::Reload.encode().unwrap());
	assert!(bystander.outbound_rx.try_recv().is_err());

	let resp = f
		.router
		.dispatch(
			req(Method::POST, "/api/admin/reload")
				.with_identity(sudo("root"))
				.with_body(json!({ "address": "not-an-ip" })),
		)
		.await;
	assert_eq!(resp.status, StatusCode::BAD_REQUEST);
	assert_eq!(resp.body["error"], "invalid_address");

	let resp = f
		.router
		.dispatch(
			req(Method::POST, "/api/admin/reload")
				.with_identity(admin("root"))
				.with_body(json!({ "address": "192.0.2.9" })),
		)
		.await;
	assert_eq!(resp.body["error"], "sudo_required");
}

#[tokio::test]
async fn admin_can_reset_a_bucket() {
	let f = admin_fixture();
	let key = address_key(IpAddr::V4(Ipv4Addr::LOCALHOST));
	assert!(f.limiter.consume(API_BUCKET, &key, 50).unwrap());

	let resp = f
		.router
		.dispatch(req(Method::POST, "/api/admin/rate-limits/api/reset").with_identity(sudo("root")))
		.await;
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(f.limiter.points(API_BUCKET, &key).unwrap(), 0);

	let resp = f
		.router
		.dispatch(req(Method::POST, "/api/admin/rate-limits/missing/reset").with_identity(sudo("root")))
		.await;
	assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn presence_and_connections_reflect_the_registry() {
	let f = admin_fixture();
	let ann = f.registry.register(peer(1)).await;
	let _anon = f.registry.register(peer(2)).await;
	assert!(f.registry.bind_identity(ann.conn_id, user("ann"), "a".into()).await);

	let resp = f
		.router
		.dispatch(req(Method::GET, "/api/presence").with_identity(user("bob")))
		.await;
	assert_eq!(resp.body["users"], json!(["ann"]));

	let resp = f
		.router
		.dispatch(req(Method::GET, "/api/admin/connections").with_identity(admin("root")))
		.await;
	assert_eq!(resp.body["total"], 2);
	assert_eq!(resp.body["authorized"], 1);
	assert_eq!(resp.body["connections"][0]["user"], "ann");
	assert_eq!(resp.body["connections"][1]["user"], Value::Null);
}

#[tokio::test]
async fn logout_closes_connections_using_the_credential() {
	let f = admin_fixture();
	let ann = f.registry.register(peer(1)).await;
	assert!(f.registry.bind_identity(ann.conn_id, user("ann"), "tok-ann".into()).await);

	let mut request = req(Method::POST, "/api/logout").with_identity(user("ann"));
	request.credential = Some("tok-ann".into());
	let resp = f.router.dispatch(request).await;

	assert_eq!(resp.body["closed"], 1);
	assert!(*ann.close_rx.borrow());
}
