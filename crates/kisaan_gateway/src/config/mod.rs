#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use kisaan_services::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.kisaan/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".kisaan").join("config.toml"))
}

/// Load the gateway config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_gateway_config() -> anyhow::Result<GatewayConfig> {
	let path = default_config_path()?;
	load_gateway_config_from_path(&path)
}

/// Same as `load_gateway_config` but with an explicit config path.
pub fn load_gateway_config_from_path(path: &Path) -> anyhow::Result<GatewayConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = GatewayConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Gateway config (v1).
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
	/// Static token accepted verbatim as an admin principal (dev/ops).
	pub auth_token: Option<SecretString>,
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub uploads: UploadSettings,
	pub media: MediaSettings,
}

/// Server settings loaded by the gateway.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for user access tokens (primary credential scheme).
	pub user_token_secret: Option<SecretString>,
	/// HMAC secret for short-lived automated-agent tokens (secondary scheme).
	pub agent_token_secret: Option<SecretString>,
	/// Per-connection outbound queue capacity.
	pub outbound_queue_capacity: usize,
	/// Messages returned with `conversation_joined`.
	pub history_limit: u32,
}

/// Persistence settings loaded by the gateway.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the SQL-backed message store; in-memory otherwise.
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

/// Upload reassembler settings.
#[derive(Debug, Clone, Default)]
pub struct UploadSettings {
	/// Idle window after which a session is reclaimed; 0 disables the sweep.
	pub idle_timeout_secs: u64,
	/// How often the reclamation sweep runs.
	pub sweep_interval_secs: u64,
	/// Largest accepted declared chunk count per session.
	pub max_total_chunks: u32,
}

/// Media submission settings.
#[derive(Debug, Clone, Default)]
pub struct MediaSettings {
	/// Base URL minted into media links.
	pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	auth_token: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	uploads: FileUploadSettings,

	#[serde(default)]
	media: FileMediaSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	user_token_secret: Option<String>,
	agent_token_secret: Option<String>,
	outbound_queue_capacity: Option<usize>,
	history_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUploadSettings {
	idle_timeout_secs: Option<u64>,
	sweep_interval_secs: Option<u64>,
	max_total_chunks: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMediaSettings {
	base_url: Option<String>,
}

impl GatewayConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			auth_token: file.auth_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				user_token_secret: file
					.server
					.user_token_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				agent_token_secret: file
					.server
					.agent_token_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				outbound_queue_capacity: file.server.outbound_queue_capacity.unwrap_or(1024),
				history_limit: file.server.history_limit.unwrap_or(50),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			uploads: UploadSettings {
				idle_timeout_secs: file.uploads.idle_timeout_secs.unwrap_or(300),
				sweep_interval_secs: file.uploads.sweep_interval_secs.unwrap_or(60),
				max_total_chunks: file.uploads.max_total_chunks.unwrap_or(4096),
			},
			media: MediaSettings {
				base_url: file.media.base_url.filter(|s| !s.trim().is_empty()),
			},
		}
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

fn apply_env_overrides(cfg: &mut GatewayConfig) {
	if let Ok(v) = std::env::var("KISAAN_AUTH_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth_token = Some(SecretString::new(v));
			info!("auth: auth_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("KISAAN_USER_TOKEN_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.user_token_secret = Some(SecretString::new(v));
			info!("auth: user_token_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("KISAAN_AGENT_TOKEN_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.agent_token_secret = Some(SecretString::new(v));
			info!("auth: agent_token_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("KISAAN_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("KISAAN_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("KISAAN_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("KISAAN_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("KISAAN_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("KISAAN_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("KISAAN_UPLOAD_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.uploads.idle_timeout_secs = secs;
		info!(secs, "uploads: idle_timeout_secs overridden by env");
	}

	if let Ok(v) = std::env::var("KISAAN_UPLOAD_SWEEP_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.uploads.sweep_interval_secs = secs;
		info!(secs, "uploads: sweep_interval_secs overridden by env");
	}

	if let Ok(v) = std::env::var("KISAAN_UPLOAD_MAX_TOTAL_CHUNKS")
		&& let Ok(max) = v.trim().parse::<u32>()
	{
		cfg.uploads.max_total_chunks = max;
		info!(max, "uploads: max_total_chunks overridden by env");
	}

	if let Ok(v) = std::env::var("KISAAN_MEDIA_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.media.base_url = Some(v);
			info!("media: base_url overridden by env");
		}
	}

	if cfg.server.user_token_secret.is_none() && cfg.auth_token.is_none() {
		tracing::warn!("auth: no user_token_secret or auth_token configured; only agent tokens will authenticate");
	}
}
