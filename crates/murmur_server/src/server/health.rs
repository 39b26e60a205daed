#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::{Method, StatusCode};
use serde_json::json;

use crate::server::router::{ApiRequest, ApiResponse, RouteRequirements, Router};

#[derive(Debug, Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// `GET /healthz` and `GET /readyz`.
pub fn register(router: &mut Router, state: HealthState) {
	router.add_route(
		Method::GET,
		"/healthz",
		|_req: ApiRequest| async move { anyhow::Ok(ApiResponse::ok(json!({ "status": "ok" }))) },
		RouteRequirements::public(),
	);

	router.add_route(
		Method::GET,
		"/readyz",
		move |_req: ApiRequest| {
			let ready = state.is_ready();
			async move {
				let resp = if ready {
					ApiResponse::ok(json!({ "status": "ready" }))
				} else {
					ApiResponse::new(StatusCode::SERVICE_UNAVAILABLE, json!({ "status": "not-ready" }))
				};
				anyhow::Ok(resp)
			}
		},
		RouteRequirements::public(),
	);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::rate_limit::RateLimiter;

	#[tokio::test]
	async fn readyz_follows_state() {
		let state = HealthState::new();
		let mut router = Router::new(RateLimiter::default());
		register(&mut router, state.clone());

		let resp = router.dispatch(ApiRequest::new(Method::GET, "/readyz")).await;
		assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		let resp = router.dispatch(ApiRequest::new(Method::GET, "/readyz")).await;
		assert_eq!(resp.status, StatusCode::OK);

		let resp = router.dispatch(ApiRequest::new(Method::GET, "/healthz")).await;
		assert_eq!(resp.body["status"], "ok");
	}
}
