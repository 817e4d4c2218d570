#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use kisaan_domain::{ConversationId, FarmerId, MimeClass, UploadId};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::server::error::GatewayError;
use crate::util::time::unix_ms_now;

/// Upper bound on remembered finished upload ids.
const MAX_FINISHED_IDS: usize = 4096;

/// Configuration for the upload reassembler.
#[derive(Debug, Clone)]
pub struct UploadConfig {
	/// Largest accepted declared chunk count per session.
	pub max_total_chunks: u32,

	pub debug_logs: bool,
}

impl Default for UploadConfig {
	fn default() -> Self {
		Self {
			max_total_chunks: 4096,
			debug_logs: false,
		}
	}
}

/// One inbound chunk, already base64-decoded.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
	pub upload_id: UploadId,
	pub chunk_index: u32,
	pub data: Bytes,
	pub total_chunks: u32,
	pub mime_type: String,
	pub conversation_id: ConversationId,
}

/// Result of ingesting one chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
	Progress {
		received: u32,
		total: u32,
	},
	Completed(CompletedUpload),
}

/// A fully reassembled payload, ready for the media-submission path.
#[derive(Debug)]
pub struct CompletedUpload {
	pub upload_id: UploadId,
	pub conversation_id: ConversationId,
	pub owner_farmer: FarmerId,
	pub mime_class: MimeClass,
	pub payload: Bytes,
}

struct UploadSession {
	owner_conn: u64,
	owner_farmer: FarmerId,
	conversation_id: ConversationId,
	mime_class: MimeClass,
	total_chunks: u32,
	#[allow(dead_code)]
	started_at_unix_ms: i64,
	state: Mutex<SessionState>,
}

struct SessionState {
	chunks: HashMap<u32, Bytes>,
	last_activity: Instant,
	completed: bool,
}

/// Per-upload-id reassembly state machine.
///
/// Sessions support concurrent reads of the table and exclusive per-session
/// mutation; chunk concatenation is offloaded to a blocking worker so large
/// files do not starve the event-processing path.
pub struct UploadReassembler {
	sessions: RwLock<HashMap<UploadId, Arc<UploadSession>>>,
	finished: Mutex<HashSet<UploadId>>,
	cfg: UploadConfig,
}

impl UploadReassembler {
	pub fn new(cfg: UploadConfig) -> Self {
		Self {
			sessions: RwLock::new(HashMap::new()),
			finished: Mutex::new(HashSet::new()),
			cfg,
		}
	}

	/// Record one chunk for the owning connection, opening a session on the
	/// first chunk. Duplicate indices overwrite (idempotent under retry).
	pub async fn ingest_chunk(
		&self,
		conn_id: u64,
		owner_farmer: &FarmerId,
		frame: ChunkFrame,
	) -> Result<ChunkOutcome, GatewayError> {
		let session = self.lookup_or_open(conn_id, owner_farmer, &frame).await?;

		if session.owner_conn != conn_id {
			return Err(GatewayError::Ownership(format!(
				"upload {} belongs to another connection",
				frame.upload_id
			)));
		}

		if frame.chunk_index >= session.total_chunks {
			return Err(GatewayError::Validation(format!(
				"chunk index {} out of range (total {})",
				frame.chunk_index, session.total_chunks
			)));
		}

		let chunk_map = {
			let mut state = session.state.lock().await;
			if state.completed {
				return Err(GatewayError::UnknownSession(frame.upload_id));
			}

			state.chunks.insert(frame.chunk_index, frame.data);
			state.last_activity = Instant::now();

			let received = state.chunks.len() as u32;
			if received < session.total_chunks {
				metrics::counter!("kisaan_gateway_upload_chunks_total").increment(1);
				return Ok(ChunkOutcome::Progress {
					received,
					total: session.total_chunks,
				});
			}

			state.completed = true;
			std::mem::take(&mut state.chunks)
		};

		self.remove_session(&frame.upload_id).await;

		// Completion requires every index in [0, total), so the concatenation
		// below cannot observe gaps.
		let total = session.total_chunks;
		let payload = tokio::task::spawn_blocking(move || {
			let size: usize = chunk_map.values().map(Bytes::len).sum();
			let mut out = Vec::with_capacity(size);
			for idx in 0..total {
				if let Some(chunk) = chunk_map.get(&idx) {
					out.extend_from_slice(chunk);
				}
			}
			Bytes::from(out)
		})
		.await
		.map_err(|e| GatewayError::Internal(format!("reassembly task failed: {e}")))?;

		metrics::counter!("kisaan_gateway_uploads_completed_total").increment(1);
		if self.cfg.debug_logs {
			debug!(upload_id = %frame.upload_id, bytes = payload.len(), "upload reassembled");
		}

		Ok(ChunkOutcome::Completed(CompletedUpload {
			upload_id: frame.upload_id,
			conversation_id: session.conversation_id,
			owner_farmer: session.owner_farmer.clone(),
			mime_class: session.mime_class,
			payload,
		}))
	}

	async fn lookup_or_open(
		&self,
		conn_id: u64,
		owner_farmer: &FarmerId,
		frame: &ChunkFrame,
	) -> Result<Arc<UploadSession>, GatewayError> {
		{
			let sessions = self.sessions.read().await;
			if let Some(session) = sessions.get(&frame.upload_id) {
				return Ok(Arc::clone(session));
			}
		}

		{
			let finished = self.finished.lock().await;
			if finished.contains(&frame.upload_id) {
				return Err(GatewayError::UnknownSession(frame.upload_id.clone()));
			}
		}

		if frame.chunk_index != 0 {
			return Err(GatewayError::UnknownSession(frame.upload_id.clone()));
		}

		if frame.total_chunks == 0 {
			return Err(GatewayError::Validation("total_chunks must be positive".to_string()));
		}
		if frame.total_chunks > self.cfg.max_total_chunks {
			return Err(GatewayError::Validation(format!(
				"total_chunks {} exceeds limit {}",
				frame.total_chunks, self.cfg.max_total_chunks
			)));
		}

		let Some(mime_class) = MimeClass::classify(&frame.mime_type) else {
			return Err(GatewayError::Validation(format!(
				"unsupported mime type: {}",
				frame.mime_type
			)));
		};

		let session = Arc::new(UploadSession {
			owner_conn: conn_id,
			owner_farmer: owner_farmer.clone(),
			conversation_id: frame.conversation_id,
			mime_class,
			total_chunks: frame.total_chunks,
			started_at_unix_ms: unix_ms_now(),
			state: Mutex::new(SessionState {
				chunks: HashMap::new(),
				last_activity: Instant::now(),
				completed: false,
			}),
		});

		let mut sessions = self.sessions.write().await;
		let entry = sessions.entry(frame.upload_id.clone()).or_insert_with(|| {
			metrics::counter!("kisaan_gateway_uploads_opened_total").increment(1);
			session
		});
		Ok(Arc::clone(entry))
	}

	async fn remove_session(&self, upload_id: &UploadId) {
		{
			let mut sessions = self.sessions.write().await;
			sessions.remove(upload_id);
		}

		let mut finished = self.finished.lock().await;
		if finished.len() >= MAX_FINISHED_IDS {
			finished.clear();
		}
		finished.insert(upload_id.clone());
	}

	/// Explicit cancellation; discards partial data immediately.
	pub async fn cancel(&self, upload_id: &UploadId, conn_id: u64) -> Result<(), GatewayError> {
		let session = {
			let sessions = self.sessions.read().await;
			sessions.get(upload_id).cloned()
		};

		let Some(session) = session else {
			return Err(GatewayError::UnknownSession(upload_id.clone()));
		};

		if session.owner_conn != conn_id {
			return Err(GatewayError::Ownership(format!(
				"upload {upload_id} belongs to another connection"
			)));
		}

		self.remove_session(upload_id).await;
		metrics::counter!("kisaan_gateway_uploads_cancelled_total").increment(1);
		Ok(())
	}

	/// Abandoned-upload reclamation for a disconnected connection.
	pub async fn cancel_all_for(&self, conn_id: u64) -> Vec<UploadId> {
		let owned: Vec<UploadId> = {
			let sessions = self.sessions.read().await;
			sessions
				.iter()
				.filter(|(_, s)| s.owner_conn == conn_id)
				.map(|(id, _)| id.clone())
				.collect()
		};

		for id in &owned {
			self.remove_session(id).await;
			metrics::counter!("kisaan_gateway_uploads_cancelled_total").increment(1);
		}
		owned
	}

	/// Cancel sessions with no chunk activity for `max_idle`; identical in
	/// effect to a disconnect-triggered cancellation.
	pub async fn reclaim_idle(&self, max_idle: Duration) -> Vec<UploadId> {
		let candidates: Vec<(UploadId, Arc<UploadSession>)> = {
			let sessions = self.sessions.read().await;
			sessions.iter().map(|(id, s)| (id.clone(), Arc::clone(s))).collect()
		};

		let mut expired = Vec::new();
		for (id, session) in candidates {
			let idle = {
				let state = session.state.lock().await;
				state.last_activity.elapsed()
			};
			if idle >= max_idle {
				expired.push(id);
			}
		}

		for id in &expired {
			warn!(upload_id = %id, "reclaiming idle upload session");
			self.remove_session(id).await;
			metrics::counter!("kisaan_gateway_uploads_reclaimed_total").increment(1);
		}
		expired
	}

	pub async fn active_count(&self) -> usize {
		let sessions = self.sessions.read().await;
		sessions.len()
	}
}
