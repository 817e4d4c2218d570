#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kisaan_services::media::SimulatedMediaSubmitter;
use kisaan_services::memory::{MemoryMessageStore, MemoryUserDirectory};
use kisaan_services::reply::KeywordReplyEngine;
use kisaan_services::sql::{SqlMessageStore, SqlUserDirectory};
use kisaan_services::{MediaSubmitter, MessageStore, ReplyEngine, UserDirectory};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::QuicServerConfig;
use crate::server::auth::Authenticator;
use crate::server::connection::{ConnectionSettings, GatewayServices, handle_connection};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::registry::{RegistryConfig, RoomRegistry};
use crate::server::router::{MessageRouter, RouterConfig};
use crate::server::uploads::{UploadConfig, UploadReassembler};
use crate::util::endpoint::BindEndpoint;

/// Dev-only seeding of the in-memory user directory: `id:Name,id2:Name2`.
const KISAAN_DEV_FARMERS_ENV: &str = "KISAAN_DEV_FARMERS";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: kisaan_gateway [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:18300)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:18300".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = BindEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,kisaan_gateway=debug".to_string());

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
				let tracer = tracer_provider.tracer("kisaan_gateway");
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

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn seed_dev_farmers(directory: &MemoryUserDirectory) {
	let Ok(raw) = std::env::var(KISAAN_DEV_FARMERS_ENV) else {
		return;
	};

	for entry in raw.split(',') {
		let entry = entry.trim();
		if entry.is_empty() {
			continue;
		}
		match entry.split_once(':') {
			Some((id, name)) if !id.trim().is_empty() && !name.trim().is_empty() => {
				directory.insert_farmer(id.trim(), name.trim()).await;
				info!(farmer = id.trim(), "seeded dev farmer");
			}
			_ => warn!(entry, "ignoring malformed dev farmer entry (expected id:Name)"),
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let gateway_cfg = crate::config::load_gateway_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded gateway config (toml + env overrides)");

	init_metrics(gateway_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = gateway_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let (store, directory): (Arc<dyn MessageStore>, Arc<dyn UserDirectory>) = if gateway_cfg.persistence.enabled {
		let Some(database_url) = gateway_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		let store = SqlMessageStore::connect(database_url).await?;
		let directory = SqlUserDirectory::connect(database_url).await?;
		(Arc::new(store), Arc::new(directory))
	} else {
		let directory = MemoryUserDirectory::new();
		if cfg!(debug_assertions) {
			seed_dev_farmers(&directory).await;
		}
		warn!("persistence disabled; conversations are lost on restart");
		(Arc::new(MemoryMessageStore::new()), Arc::new(directory))
	};

	let media: Arc<dyn MediaSubmitter> = match gateway_cfg.media.base_url.as_deref() {
		Some(base_url) => Arc::new(SimulatedMediaSubmitter::new(base_url)),
		None => Arc::new(SimulatedMediaSubmitter::default()),
	};
	let engine: Arc<dyn ReplyEngine> = Arc::new(KeywordReplyEngine::new());

	let registry = Arc::new(RoomRegistry::new(RegistryConfig::default()));
	let uploads = Arc::new(UploadReassembler::new(UploadConfig {
		max_total_chunks: gateway_cfg.uploads.max_total_chunks,
		..UploadConfig::default()
	}));

	let router = Arc::new(MessageRouter::new(
		Arc::clone(&store),
		Arc::clone(&directory),
		engine,
		Arc::clone(&registry),
		RouterConfig {
			history_limit: gateway_cfg.server.history_limit,
			..RouterConfig::default()
		},
	));

	let auth = Arc::new(Authenticator::new(
		gateway_cfg.server.user_token_secret.clone(),
		gateway_cfg.server.agent_token_secret.clone(),
		gateway_cfg.auth_token.clone(),
		Arc::clone(&directory),
	));

	let services = GatewayServices {
		auth,
		registry,
		uploads: Arc::clone(&uploads),
		media,
		router,
	};

	// Abandoned-upload reclamation: idle sessions are cancelled exactly like
	// a disconnect would cancel them.
	if gateway_cfg.uploads.idle_timeout_secs > 0 {
		let max_idle = Duration::from_secs(gateway_cfg.uploads.idle_timeout_secs);
		let sweep_every = Duration::from_secs(gateway_cfg.uploads.sweep_interval_secs.max(1));
		let uploads_for_sweep = Arc::clone(&uploads);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(sweep_every);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				interval.tick().await;
				let reclaimed = uploads_for_sweep.reclaim_idle(max_idle).await;
				if !reclaimed.is_empty() {
					info!(count = reclaimed.len(), "reclaimed idle upload sessions");
				}
			}
		});
	}

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		gateway_cfg.server.tls_cert_path.as_deref(),
		gateway_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"kisaan_gateway: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings {
		outbound_queue_capacity: gateway_cfg.server.outbound_queue_capacity,
		..ConnectionSettings::default()
	};

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("kisaan_gateway_connections_total").increment(1);

		let services = services.clone();
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					tracing::info!(conn_id, remote = %connection.remote_address(), "accepted connection");

					if let Err(e) = handle_connection(conn_id, connection, services, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
