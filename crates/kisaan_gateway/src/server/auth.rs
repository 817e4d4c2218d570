#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use kisaan_domain::{FarmerId, PrincipalKind};
use kisaan_services::{ASSISTANT_NAME, ASSISTANT_SENDER_ID, SecretString, UserDirectory};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::server::error::GatewayError;
use crate::server::registry::Principal;

/// Claims carried by `v1.<payload>.<sig>` tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token for `sub` expiring at `exp` (unix seconds).
///
/// Used by the token-issuance flow for short-lived agent credentials, and by
/// tests.
pub fn sign_hmac_token(sub: &str, exp: u64, secret: &str) -> String {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp,
	};
	let payload = serde_json::to_vec(&claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(sig))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
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

/// Classifies connect-time credentials into principals.
///
/// Two schemes are tried in a fixed order: the user scheme first, the
/// short-lived agent scheme second. Raw tokens are never logged.
pub struct Authenticator {
	user_secret: Option<SecretString>,
	agent_secret: Option<SecretString>,
	static_admin_token: Option<SecretString>,
	directory: Arc<dyn UserDirectory>,
}

impl Authenticator {
	pub fn new(
		user_secret: Option<SecretString>,
		agent_secret: Option<SecretString>,
		static_admin_token: Option<SecretString>,
		directory: Arc<dyn UserDirectory>,
	) -> Self {
		Self {
			user_secret,
			agent_secret,
			static_admin_token,
			directory,
		}
	}

	pub async fn authenticate(&self, token: &str) -> Result<Principal, GatewayError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(GatewayError::Authentication("missing auth token".to_string()));
		}

		// Dev/ops escape hatch: a configured static token maps to an admin.
		if let Some(expected) = self.static_admin_token.as_ref()
			&& token == expected.expose()
		{
			let farmer_id = FarmerId::new("admin").map_err(|e| GatewayError::Internal(e.to_string()))?;
			return Ok(Principal {
				kind: PrincipalKind::Admin,
				principal_id: "admin".to_string(),
				display_name: "Administrator".to_string(),
				farmer_id,
			});
		}

		// Primary scheme: user tokens, resolved through the user store. A
		// token that verifies here is a user token; an unknown subject is a
		// hard rejection, not a fall-through.
		if let Some(secret) = self.user_secret.as_ref() {
			match verify_hmac_token(token, secret.expose()) {
				Ok(claims) => {
					let profile = self
						.directory
						.find_user(&claims.sub)
						.await
						.map_err(GatewayError::Persistence)?;

					let Some(profile) = profile else {
						warn!(sub = %claims.sub, "auth: user token for unknown principal");
						return Err(GatewayError::Authentication("principal not found".to_string()));
					};

					if profile.role == PrincipalKind::AutomatedAgent {
						return Err(GatewayError::Authentication("agent principals must use agent tokens".to_string()));
					}

					let farmer_id =
						FarmerId::new(profile.id.clone()).map_err(|e| GatewayError::Internal(e.to_string()))?;
					return Ok(Principal {
						kind: profile.role,
						principal_id: profile.id,
						display_name: profile.name,
						farmer_id,
					});
				}
				Err(_) => {
					// Fall through to the agent scheme below.
				}
			}
		}

		// Secondary scheme: short-lived agent tokens scoped to one farmer.
		if let Some(secret) = self.agent_secret.as_ref()
			&& let Ok(claims) = verify_hmac_token(token, secret.expose())
		{
			let farmer_id = FarmerId::new(claims.sub)
				.map_err(|_| GatewayError::Authentication("agent token has empty farmer id".to_string()))?;
			return Ok(Principal {
				kind: PrincipalKind::AutomatedAgent,
				principal_id: ASSISTANT_SENDER_ID.to_string(),
				display_name: ASSISTANT_NAME.to_string(),
				farmer_id,
			});
		}

		warn!("auth: token rejected by both credential schemes");
		Err(GatewayError::Authentication("invalid auth token".to_string()))
	}
}
