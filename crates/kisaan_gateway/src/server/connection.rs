#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use kisaan_domain::{PrincipalKind, Room};
use kisaan_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use kisaan_protocol::{ClientEvent, ClientFrame, Envelope, ServerEvent, ServerFrame};
use kisaan_services::MediaSubmitter;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::auth::Authenticator;
use crate::server::error::GatewayError;
use crate::server::registry::{Principal, RoomRegistry};
use crate::server::router::{MessageRouter, SendRequest};
use crate::server::uploads::{ChunkFrame, ChunkOutcome, UploadReassembler};
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	pub outbound_queue_capacity: usize,

	pub server_name: String,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			outbound_queue_capacity: 1024,
			server_name: format!("kisaan-gateway/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

/// Shared per-process services handed to every connection task.
#[derive(Clone)]
pub struct GatewayServices {
	pub auth: Arc<Authenticator>,
	pub registry: Arc<RoomRegistry>,
	pub uploads: Arc<UploadReassembler>,
	pub media: Arc<dyn MediaSubmitter>,
	pub router: Arc<MessageRouter>,
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	services: GatewayServices,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("kisaan_gateway_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("kisaan_gateway_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut event_send, mut event_recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let max_frame = settings.max_frame_bytes as usize;
	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ClientFrame>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match event_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("kisaan_gateway_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match kisaan_protocol::decode_frame::<ClientFrame>(&buf, max_frame) {
					Ok((frame, used)) => {
						buf.drain(0..used);
						metrics::counter!("kisaan_gateway_frames_in_total").increment(1);

						if ctrl_tx.send(frame).is_err() {
							return Ok(());
						}
					}
					Err(kisaan_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("kisaan_gateway_frame_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode inbound frame"));
					}
				}
			}
		}
	});

	// The writer owns the send half; everything outbound goes through one
	// bounded queue, including room broadcasts delivered via the registry.
	let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(settings.outbound_queue_capacity);
	let writer_task = tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			let bytes = match encode_frame(&frame, max_frame) {
				Ok(b) => b,
				Err(e) => {
					metrics::counter!("kisaan_gateway_frame_encode_errors_total").increment(1);
					error!(error = %e, "dropping outbound frame that failed to encode");
					continue;
				}
			};

			metrics::counter!("kisaan_gateway_frames_out_total").increment(1);
			metrics::counter!("kisaan_gateway_bytes_out_total").increment(bytes.len() as u64);

			if let Err(e) = event_send.write_all(&bytes).await {
				return Err(anyhow!(e).context("stream write failed"));
			}
		}
		Ok::<(), anyhow::Error>(())
	});

	let (auth_token, hello_request_id) = match wait_for_hello(&mut ctrl_rx).await {
		Ok(hello) => hello,
		Err(e) => {
			debug!(conn_id, error = %e, "connection closed before hello");
			drop(out_tx);
			let _ = reader_task.await;
			let _ = writer_task.await;
			return Ok(());
		}
	};

	let principal = match services.auth.authenticate(&auth_token).await {
		Ok(principal) => principal,
		Err(e) => {
			warn!(conn_id, "rejecting connection: authentication failed");
			metrics::counter!("kisaan_gateway_auth_rejections_total").increment(1);
			let _ = out_tx
				.send(Envelope::with_request_id(e.to_event(), hello_request_id))
				.await;
			drop(out_tx);
			let _ = reader_task.await;
			let _ = writer_task.await;
			return Ok(());
		}
	};

	info!(
		conn_id,
		kind = %principal.kind,
		principal = %principal.principal_id,
		farmer = %principal.farmer_id,
		"connection authenticated"
	);
	metrics::counter!("kisaan_gateway_connections_authenticated_total").increment(1);

	services.registry.register(conn_id, principal.clone(), out_tx.clone()).await;

	let welcome = ServerEvent::Welcome {
		server_name: settings.server_name.clone(),
		principal_kind: principal.kind,
		display_name: principal.display_name.clone(),
		farmer_id: principal.farmer_id.clone(),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: settings.max_frame_bytes,
	};
	let _ = out_tx.send(Envelope::with_request_id(welcome, hello_request_id)).await;

	while let Some(frame) = ctrl_rx.recv().await {
		let request_id = frame.request_id.clone();

		if let Err(e) = handle_event(conn_id, &principal, &services, &out_tx, frame).await {
			metrics::counter!("kisaan_gateway_event_errors_total").increment(1);
			debug!(conn_id, kind = %e.kind(), error = %e, "event failed");
			let _ = out_tx.send(Envelope::with_request_id(e.to_event(), request_id)).await;
		}
	}

	disconnect_cleanup(conn_id, &principal, &services).await;

	drop(out_tx);
	let _ = reader_task.await;
	let _ = writer_task.await;

	Ok(())
}

/// Tear down everything the connection owns: room memberships, in-flight
/// uploads, transient typing state. Idempotent.
async fn disconnect_cleanup(conn_id: u64, principal: &Principal, services: &GatewayServices) {
	if principal.kind == PrincipalKind::Farmer
		&& let Some(conversation_id) = services.registry.clear_typing(&principal.farmer_id).await
	{
		services
			.registry
			.broadcast(&Room::AdminMonitoring, ServerEvent::FarmerTyping {
				farmer_id: principal.farmer_id.clone(),
				farmer_name: principal.display_name.clone(),
				conversation_id,
				is_typing: false,
			})
			.await;
	}

	let cancelled = services.uploads.cancel_all_for(conn_id).await;
	if !cancelled.is_empty() {
		info!(conn_id, uploads = cancelled.len(), "cancelled in-flight uploads on disconnect");
	}

	services.registry.deregister(conn_id).await;
	info!(conn_id, principal = %principal.principal_id, "connection closed");
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<ClientFrame>) -> anyhow::Result<(String, String)> {
	while let Some(frame) = ctrl_rx.recv().await {
		if let ClientEvent::Hello { auth_token } = frame.event {
			return Ok((auth_token, frame.request_id));
		}
	}
	Err(anyhow!("connection closed before hello"))
}

async fn handle_event(
	conn_id: u64,
	principal: &Principal,
	services: &GatewayServices,
	out_tx: &mpsc::Sender<ServerFrame>,
	frame: ClientFrame,
) -> Result<(), GatewayError> {
	let request_id = frame.request_id;
	let reply = |event: ServerEvent| Envelope::with_request_id(event, request_id.clone());

	match frame.event {
		ClientEvent::Hello { .. } => {
			debug!(conn_id, "ignoring duplicate hello");
			let _ = out_tx.send(reply(ServerEvent::Ack)).await;
		}

		ClientEvent::JoinConversation => {
			let (conversation, messages) = services.router.join_conversation(conn_id, principal).await?;
			let _ = out_tx
				.send(reply(ServerEvent::ConversationJoined { conversation, messages }))
				.await;
		}

		ClientEvent::SendMessage {
			conversation_id,
			message_type,
			content,
			media_url,
			media_duration_secs,
			media_size_bytes,
		} => {
			let outcome = Arc::clone(&services.router)
				.send_message(principal, SendRequest {
					conversation_id,
					message_type,
					content,
					media_url,
					media_duration_secs,
					media_size_bytes,
				})
				.await?;

			// The automated reply runs detached; the ack never waits on it.
			drop(outcome.reply_task);
			let _ = out_tx.send(reply(ServerEvent::MessageSent { message: outcome.message })).await;
		}

		ClientEvent::UploadChunk {
			upload_id,
			chunk_index,
			chunk_data,
			total_chunks,
			mime_type,
			conversation_id,
		} => {
			let data = match BASE64.decode(chunk_data.as_bytes()) {
				Ok(data) => Bytes::from(data),
				Err(e) => {
					let _ = out_tx
						.send(reply(ServerEvent::UploadError {
							upload_id,
							kind: kisaan_protocol::ErrorKind::Validation,
							detail: format!("chunk_data is not valid base64: {e}"),
						}))
						.await;
					return Ok(());
				}
			};

			let chunk = ChunkFrame {
				upload_id: upload_id.clone(),
				chunk_index,
				data,
				total_chunks,
				mime_type,
				conversation_id,
			};

			match services.uploads.ingest_chunk(conn_id, &principal.farmer_id, chunk).await {
				Ok(ChunkOutcome::Progress { received, total }) => {
					let percent = (received as f32 / total as f32) * 100.0;
					let _ = out_tx
						.send(reply(ServerEvent::UploadProgress { upload_id, percent }))
						.await;
				}
				Ok(ChunkOutcome::Completed(completed)) => {
					let size_bytes = completed.payload.len() as u64;
					let media_url = match services
						.media
						.submit(completed.payload, completed.mime_class, &completed.owner_farmer)
						.await
					{
						Ok(url) => url,
						Err(e) => {
							warn!(conn_id, upload_id = %upload_id, error = %e, "media submission failed");
							let _ = out_tx
								.send(reply(ServerEvent::UploadError {
									upload_id,
									kind: kisaan_protocol::ErrorKind::Persistence,
									detail: "media submission failed".to_string(),
								}))
								.await;
							return Ok(());
						}
					};

					// Chunk streams carry no duration metadata; record zero
					// with the reassembled byte size.
					let send = Arc::clone(&services.router)
						.send_message(principal, SendRequest {
							conversation_id: completed.conversation_id,
							message_type: completed.mime_class.message_type(),
							content: None,
							media_url: Some(media_url),
							media_duration_secs: Some(0),
							media_size_bytes: Some(size_bytes),
						})
						.await;

					match send {
						Ok(outcome) => {
							drop(outcome.reply_task);
							let _ = out_tx
								.send(reply(ServerEvent::UploadComplete {
									upload_id,
									message: outcome.message,
								}))
								.await;
						}
						Err(e) => {
							let _ = out_tx
								.send(reply(ServerEvent::UploadError {
									upload_id,
									kind: e.kind(),
									detail: e.to_string(),
								}))
								.await;
						}
					}
				}
				Err(e) => {
					let _ = out_tx
						.send(reply(ServerEvent::UploadError {
							upload_id,
							kind: e.kind(),
							detail: e.to_string(),
						}))
						.await;
				}
			}
		}

		ClientEvent::CancelUpload { upload_id } => {
			services.uploads.cancel(&upload_id, conn_id).await?;
			let _ = out_tx.send(reply(ServerEvent::UploadCancelled { upload_id })).await;
		}

		ClientEvent::TypingStart { conversation_id } => {
			services.router.typing(principal, conversation_id, true).await?;
			let _ = out_tx.send(reply(ServerEvent::Ack)).await;
		}

		ClientEvent::TypingStop { conversation_id } => {
			services.router.typing(principal, conversation_id, false).await?;
			let _ = out_tx.send(reply(ServerEvent::Ack)).await;
		}

		ClientEvent::MarkMessagesRead { conversation_id } => {
			let updated = services.router.mark_read(principal, conversation_id).await?;
			let _ = out_tx
				.send(reply(ServerEvent::MessagesMarkedRead { conversation_id, updated }))
				.await;
		}

		ClientEvent::SendProactiveMessage {
			farmer_id,
			content,
			alert_type,
			message_type,
		} => {
			let message = services
				.router
				.send_proactive(principal, &farmer_id, content, alert_type, message_type)
				.await?;
			let _ = out_tx.send(reply(ServerEvent::ProactiveSent { message })).await;
		}

		ClientEvent::BroadcastEmergency { content, alert_type } => {
			let (delivered, failed) = services
				.router
				.broadcast_emergency(principal, &content, alert_type)
				.await?;
			let _ = out_tx
				.send(reply(ServerEvent::EmergencyBroadcastResult { delivered, failed }))
				.await;
		}

		ClientEvent::AdminMonitorAll => {
			if principal.kind != PrincipalKind::Admin {
				return Err(GatewayError::Ownership("monitoring is admin only".to_string()));
			}
			services.registry.join(conn_id, Room::AdminMonitoring).await?;
			info!(conn_id, admin = %principal.principal_id, "admin monitoring all conversations");
			let _ = out_tx.send(reply(ServerEvent::Ack)).await;
		}

		ClientEvent::GetPresence => {
			let snapshot = services.registry.stats().await;
			let _ = out_tx.send(reply(ServerEvent::Presence { snapshot })).await;
		}

		ClientEvent::Ping { client_time_unix_ms } => {
			let _ = out_tx
				.send(reply(ServerEvent::Pong {
					client_time_unix_ms,
					server_time_unix_ms: unix_ms_now(),
				}))
				.await;
		}
	}

	Ok(())
}
