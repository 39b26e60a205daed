#![forbid(unsafe_code)]

mod config;
mod handlers;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use murmur_protocol::EngineConfig;
use murmur_util::endpoint::BindEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::PacketHandlerKind;
use crate::handlers::PacketHandler;
use crate::handlers::null::NullPacketHandler;
use crate::handlers::relay::RelayPacketHandler;
use crate::server::auth::{HmacTokenVerifier, IdentityVerifier, StaticVerifier};
use crate::server::connection::ConnectionSettings;
use crate::server::health::HealthState;
use crate::server::http::{HttpSettings, HttpState};
use crate::server::rate_limit::RateLimiter;
use crate::server::registry::Registry;
use crate::server::router::Router;

const DEFAULT_BIND: &str = "http://127.0.0.1:18480";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: murmur_server [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: http://127.0.0.1:18480)\n\
\t         Format: http://host:port\n\
\t--config  Config file (default: ~/.murmur/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args { bind: None, config: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(endpoint: &str) -> anyhow::Result<SocketAddr> {
	let bind = BindEndpoint::parse(endpoint).map_err(|e| anyhow!(e))?;
	bind.to_socket_addr_if_ip_literal().map_err(|e| anyhow!(e))
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,murmur_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("murmur_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	let addr = match resolve_bind(bind) {
		Ok(addr) => addr,
		Err(e) => {
			warn!(error = %e, "invalid metrics_bind; metrics disabled");
			return;
		}
	};

	match metrics_exporter_prometheus::PrometheusBuilder::new()
		.with_http_listener(addr)
		.install()
	{
		Ok(()) => info!(%addr, "prometheus exporter listening"),
		Err(e) => warn!(error = %e, %addr, "failed to start prometheus exporter"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let bind_endpoint = args
		.bind
		.or_else(|| server_cfg.server.bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());
	let bind_addr = resolve_bind(&bind_endpoint).context("resolve bind endpoint")?;

	let limiter = RateLimiter::new(server_cfg.rate_limit.overflow_policy);
	for bucket in &server_cfg.rate_limit.buckets {
		limiter
			.create(&bucket.id, bucket.capacity, bucket.window)
			.with_context(|| format!("create rate limit bucket {}", bucket.id))?;
	}
	let _reset_timer = limiter.spawn_reset_timer(server_cfg.rate_limit.reset_tick);
	info!(
		buckets = ?limiter.bucket_ids(),
		overflow_policy = ?limiter.policy(),
		"rate limiter ready"
	);

	let verifier: Arc<dyn IdentityVerifier> = match server_cfg.server.auth_hmac_secret.clone() {
		Some(secret) => Arc::new(HmacTokenVerifier::new(secret)),
		None => {
			warn!("no auth_hmac_secret configured; every authorize will be rejected");
			Arc::new(StaticVerifier::new())
		}
	};

	let handler: Arc<dyn PacketHandler> = match server_cfg.server.packet_handler {
		PacketHandlerKind::Relay => Arc::new(RelayPacketHandler),
		PacketHandlerKind::Null => Arc::new(NullPacketHandler),
	};

	let conn_settings = ConnectionSettings {
		engine: EngineConfig::with_max_payload(server_cfg.server.max_frame_payload_bytes),
		auth_timeout: server_cfg.server.auth_timeout,
		outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
		..ConnectionSettings::default()
	};
	let registry = Registry::new(conn_settings, limiter.clone(), verifier, handler);

	let health_state = HealthState::new();
	let mut router = Router::new(limiter.clone());
	crate::server::health::register(&mut router, health_state.clone());
	crate::server::admin::register(&mut router, registry.clone(), limiter);

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(
		bind = %bind_addr,
		gateway_path = %server_cfg.server.gateway_path,
		"murmur_server: listening"
	);

	let state = HttpState {
		registry: registry.clone(),
		router: Arc::new(router),
		settings: Arc::new(HttpSettings {
			gateway_path: server_cfg.server.gateway_path.clone(),
			max_body_bytes: server_cfg.server.max_http_body_bytes,
			trust_proxy: server_cfg.server.trust_proxy,
		}),
	};

	health_state.mark_ready();

	tokio::select! {
		res = crate::server::http::serve(listener, state) => res?,
		_ = tokio::signal::ctrl_c() => {
			health_state.mark_not_ready();
			info!(open_connections = registry.connection_count().await, "shutdown requested");
		}
	}

	Ok(())
}
