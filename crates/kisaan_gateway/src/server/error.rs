#![forbid(unsafe_code)]

use kisaan_domain::UploadId;
use kisaan_protocol::{ErrorKind, ServerEvent};
use kisaan_services::StoreError;
use thiserror::Error;

/// Failures local to one inbound event or one connection.
///
/// Every variant maps to a stable wire `kind`; none of them tears down the
/// gateway or affects other connections.
#[derive(Debug, Error)]
pub enum GatewayError {
	#[error("authentication failed: {0}")]
	Authentication(String),

	#[error("connection is not registered")]
	NotRegistered,

	#[error("{0}")]
	Ownership(String),

	#[error("{0}")]
	Validation(String),

	#[error("unknown upload session: {0}")]
	UnknownSession(UploadId),

	#[error("persistence failure: {0}")]
	Persistence(#[from] StoreError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl GatewayError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			GatewayError::Authentication(_) => ErrorKind::Authentication,
			GatewayError::NotRegistered => ErrorKind::NotRegistered,
			GatewayError::Ownership(_) => ErrorKind::Ownership,
			GatewayError::Validation(_) => ErrorKind::Validation,
			GatewayError::UnknownSession(_) => ErrorKind::UnknownSession,
			GatewayError::Persistence(_) | GatewayError::Internal(_) => ErrorKind::Persistence,
		}
	}

	/// The `error` event surfaced to the originating caller.
	pub fn to_event(&self) -> ServerEvent {
		ServerEvent::Error {
			kind: self.kind(),
			message: self.to_string(),
		}
	}
}
