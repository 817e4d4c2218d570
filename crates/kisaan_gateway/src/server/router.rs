#![forbid(unsafe_code)]

use std::sync::Arc;

use kisaan_domain::{AlertType, Conversation, ConversationId, FarmerId, Message, MessageType, PrincipalKind, Room, SenderKind};
use kisaan_protocol::ServerEvent;
use kisaan_services::{
	ASSISTANT_SENDER_ID, ConversationPatch, MessageStore, NewMessage, ReplyEngine, StoreError, UserDirectory,
	reply::welcome_text, validate_new_message,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::dispatcher;
use crate::server::error::GatewayError;
use crate::server::registry::{Principal, RoomRegistry};
use crate::util::time::unix_ms_now;

/// Settings for the message router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	/// Messages returned with `conversation_joined`.
	pub history_limit: u32,

	pub debug_log_events: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			history_limit: 50,
			debug_log_events: false,
		}
	}
}

/// A `send_message` request after wire decoding.
#[derive(Debug, Clone)]
pub struct SendRequest {
	pub conversation_id: ConversationId,
	pub message_type: MessageType,
	pub content: Option<String>,
	pub media_url: Option<String>,
	pub media_duration_secs: Option<u32>,
	pub media_size_bytes: Option<u64>,
}

/// Result of a successful `send_message`.
pub struct SendOutcome {
	pub message: Message,

	/// Detached automated-reply task for farmer-authored messages. Production
	/// callers drop the handle; tests await (or abort) it.
	pub reply_task: Option<JoinHandle<()>>,
}

/// Central event state machine: validates, persists through the message
/// store, and fans out to rooms. Shared by every connection; holds no lock
/// across store calls.
pub struct MessageRouter {
	pub(crate) store: Arc<dyn MessageStore>,
	pub(crate) directory: Arc<dyn UserDirectory>,
	pub(crate) engine: Arc<dyn ReplyEngine>,
	pub(crate) registry: Arc<RoomRegistry>,
	cfg: RouterConfig,
}

fn alert_message_type(alert: AlertType) -> MessageType {
	match alert {
		AlertType::Weather => MessageType::WeatherAlert,
		AlertType::GovernmentScheme => MessageType::SchemeAlert,
		_ => MessageType::SystemAlert,
	}
}

impl MessageRouter {
	pub fn new(
		store: Arc<dyn MessageStore>,
		directory: Arc<dyn UserDirectory>,
		engine: Arc<dyn ReplyEngine>,
		registry: Arc<RoomRegistry>,
		cfg: RouterConfig,
	) -> Self {
		Self {
			store,
			directory,
			engine,
			registry,
			cfg,
		}
	}

	/// Join (lazily creating) the caller's conversation and return it with
	/// recent history in chronological order.
	pub async fn join_conversation(
		&self,
		conn_id: u64,
		principal: &Principal,
	) -> Result<(Conversation, Vec<Message>), GatewayError> {
		if principal.kind == PrincipalKind::Admin {
			return Err(GatewayError::Ownership(
				"admins monitor conversations via admin_monitor_all".to_string(),
			));
		}

		let conversation = self.get_or_create_conversation(&principal.farmer_id).await?;
		self.registry.join(conn_id, Room::Conversation(conversation.id)).await?;

		let messages = self
			.store
			.recent_messages(conversation.id, self.cfg.history_limit)
			.await?;

		if self.cfg.debug_log_events {
			debug!(conn_id, conversation = %conversation.id, history = messages.len(), "joined conversation");
		}

		Ok((conversation, messages))
	}

	/// Resolve the farmer's conversation, creating it on first contact. The
	/// first-contact path also persists and broadcasts the welcome message.
	pub async fn get_or_create_conversation(&self, farmer_id: &FarmerId) -> Result<Conversation, GatewayError> {
		if let Some(existing) = self.store.find_conversation(farmer_id).await? {
			return Ok(existing);
		}

		let created = match self.store.create_conversation(farmer_id).await {
			Ok(convo) => convo,
			// Lost a create race; the winner's conversation is authoritative.
			Err(StoreError::Conflict(_)) => {
				return self
					.store
					.find_conversation(farmer_id)
					.await?
					.ok_or_else(|| GatewayError::Internal("conversation vanished after create conflict".to_string()));
			}
			Err(e) => return Err(e.into()),
		};

		info!(farmer = %farmer_id, conversation = %created.id, "created conversation on first contact");
		metrics::counter!("kisaan_gateway_conversations_created_total").increment(1);

		let farmer_name = match self.directory.find_user(farmer_id.as_str()).await {
			Ok(Some(profile)) => profile.name,
			_ => "farmer".to_string(),
		};

		let welcome = NewMessage::proactive(
			created.id,
			MessageType::Text,
			welcome_text(&farmer_name),
			AlertType::Welcome,
		);
		let welcome = self.store.append_message(welcome).await?;
		self.store
			.update_conversation(created.id, ConversationPatch::after_append(&welcome).with_unread_increment())
			.await?;

		self.broadcast_message(&welcome, Some(farmer_id)).await;

		match self.store.get_conversation(created.id).await? {
			Some(convo) => Ok(convo),
			None => Ok(created),
		}
	}

	/// Validate, persist and fan out one message; schedules the automated
	/// reply for farmer-authored messages after persistence completes.
	pub async fn send_message(self: Arc<Self>, principal: &Principal, req: SendRequest) -> Result<SendOutcome, GatewayError> {
		let sender_kind = match principal.kind {
			PrincipalKind::Farmer => SenderKind::Farmer,
			PrincipalKind::AutomatedAgent => SenderKind::AutomatedAgent,
			PrincipalKind::Admin => {
				return Err(GatewayError::Ownership(
					"admins send proactive messages, not chat messages".to_string(),
				));
			}
		};

		let conversation = self.get_or_create_conversation(&principal.farmer_id).await?;

		let content = default_content(req.message_type, req.content, req.media_duration_secs);
		let sender_id = match sender_kind {
			SenderKind::Farmer => principal.farmer_id.as_str().to_string(),
			SenderKind::AutomatedAgent => ASSISTANT_SENDER_ID.to_string(),
		};

		let new_message = NewMessage {
			conversation_id: conversation.id,
			sender_id,
			sender_kind,
			message_type: req.message_type,
			content,
			media_url: req.media_url,
			media_duration_secs: req.media_duration_secs,
			media_size_bytes: req.media_size_bytes,
			is_proactive: false,
			alert_type: None,
		};
		validate_new_message(&new_message).map_err(GatewayError::Validation)?;

		let message = self.store.append_message(new_message).await?;

		let mut patch = ConversationPatch::after_append(&message);
		if sender_kind == SenderKind::AutomatedAgent {
			patch = patch.with_unread_increment();
		}
		self.store.update_conversation(conversation.id, patch).await?;

		metrics::counter!("kisaan_gateway_messages_total").increment(1);
		self.broadcast_message(&message, None).await;

		let reply_task = if sender_kind == SenderKind::Farmer {
			Some(dispatcher::spawn(Arc::clone(&self), conversation, message.clone()))
		} else {
			None
		};

		Ok(SendOutcome { message, reply_task })
	}

	/// Persist and fan out an automated-agent reply. Internal path used by
	/// the dispatcher; failures stay local to the reply.
	pub(crate) async fn persist_agent_reply(
		&self,
		conversation_id: ConversationId,
		content: String,
	) -> Result<Message, GatewayError> {
		let conversation = self
			.store
			.get_conversation(conversation_id)
			.await?
			.ok_or_else(|| GatewayError::Validation(format!("conversation {conversation_id} not found")))?;

		let reply = NewMessage::text(conversation.id, ASSISTANT_SENDER_ID, SenderKind::AutomatedAgent, content);
		let reply = self.store.append_message(reply).await?;
		self.store
			.update_conversation(conversation.id, ConversationPatch::after_append(&reply).with_unread_increment())
			.await?;

		metrics::counter!("kisaan_gateway_agent_replies_total").increment(1);
		self.broadcast_message(&reply, Some(&conversation.farmer_id)).await;
		Ok(reply)
	}

	/// Transition unread automated-agent messages to read. Idempotent.
	pub async fn mark_read(&self, principal: &Principal, conversation_id: ConversationId) -> Result<u64, GatewayError> {
		let conversation = self
			.store
			.get_conversation(conversation_id)
			.await?
			.ok_or_else(|| GatewayError::Validation(format!("conversation {conversation_id} not found")))?;

		if principal.kind != PrincipalKind::Admin && conversation.farmer_id != principal.farmer_id {
			return Err(GatewayError::Ownership("conversation belongs to another farmer".to_string()));
		}

		let updated = self.store.mark_messages_read(conversation_id, unix_ms_now()).await?;
		Ok(updated)
	}

	/// Persist and deliver a proactive message to one farmer. Admin and
	/// automated-agent use only.
	pub async fn send_proactive(
		&self,
		principal: &Principal,
		farmer_id: &FarmerId,
		content: String,
		alert_type: AlertType,
		message_type: Option<MessageType>,
	) -> Result<Message, GatewayError> {
		if !matches!(principal.kind, PrincipalKind::Admin | PrincipalKind::AutomatedAgent) {
			return Err(GatewayError::Ownership("proactive messages are admin/agent only".to_string()));
		}

		let conversation = self
			.store
			.find_conversation(farmer_id)
			.await?
			.ok_or_else(|| GatewayError::Validation(format!("no conversation for farmer {farmer_id}")))?;

		let message_type = message_type.unwrap_or_else(|| alert_message_type(alert_type));
		let proactive = NewMessage::proactive(conversation.id, message_type, content, alert_type);
		validate_new_message(&proactive).map_err(GatewayError::Validation)?;

		let message = self.store.append_message(proactive).await?;
		self.store
			.update_conversation(conversation.id, ConversationPatch::after_append(&message).with_unread_increment())
			.await?;

		metrics::counter!("kisaan_gateway_proactive_messages_total").increment(1);

		self.registry
			.broadcast(
				&Room::User(farmer_id.clone()),
				ServerEvent::ProactiveAlert {
					message: message.clone(),
					alert_type,
				},
			)
			.await;
		self.registry
			.broadcast(&Room::Conversation(conversation.id), ServerEvent::NewMessage {
				message: message.clone(),
			})
			.await;
		self.registry
			.broadcast(&Room::AdminMonitoring, ServerEvent::NewMessage {
				message: message.clone(),
			})
			.await;

		Ok(message)
	}

	/// Persist one proactive message per active conversation and deliver to
	/// each farmer's personal room. Per-conversation failures are collected,
	/// never propagated; returns `(delivered, failed)`.
	pub async fn broadcast_emergency(
		&self,
		principal: &Principal,
		content: &str,
		alert_type: AlertType,
	) -> Result<(u32, u32), GatewayError> {
		if principal.kind != PrincipalKind::Admin {
			return Err(GatewayError::Ownership("emergency broadcast is admin only".to_string()));
		}

		if content.trim().is_empty() {
			return Err(GatewayError::Validation("content is required".to_string()));
		}

		let conversations = self.store.list_active_conversations().await?;
		info!(conversations = conversations.len(), alert = %alert_type, "broadcasting emergency alert");

		let message_type = alert_message_type(alert_type);
		let mut delivered = 0u32;
		let mut failed = 0u32;

		for conversation in conversations {
			let outcome: Result<(), StoreError> = async {
				let alert = NewMessage::proactive(conversation.id, message_type, content, alert_type);
				let message = self.store.append_message(alert).await?;
				self.store
					.update_conversation(
						conversation.id,
						ConversationPatch::after_append(&message).with_unread_increment(),
					)
					.await?;

				self.registry
					.broadcast(
						&Room::User(conversation.farmer_id.clone()),
						ServerEvent::EmergencyAlert {
							message,
							alert_type,
						},
					)
					.await;
				Ok(())
			}
			.await;

			match outcome {
				Ok(()) => delivered += 1,
				Err(e) => {
					failed += 1;
					warn!(conversation = %conversation.id, error = %e, "emergency alert failed for conversation");
				}
			}
		}

		metrics::counter!("kisaan_gateway_emergency_broadcasts_total").increment(1);
		if failed > 0 {
			metrics::counter!("kisaan_gateway_emergency_failures_total").increment(failed as u64);
		}

		Ok((delivered, failed))
	}

	/// Typing relays: farmer typing goes to the admin-monitoring room only;
	/// agent typing goes to the farmer's personal room.
	pub async fn typing(
		&self,
		principal: &Principal,
		conversation_id: ConversationId,
		is_typing: bool,
	) -> Result<(), GatewayError> {
		match principal.kind {
			PrincipalKind::Farmer => {
				if is_typing {
					self.registry.set_typing(&principal.farmer_id, conversation_id).await;
				} else {
					self.registry.clear_typing(&principal.farmer_id).await;
				}
				self.registry
					.broadcast(&Room::AdminMonitoring, ServerEvent::FarmerTyping {
						farmer_id: principal.farmer_id.clone(),
						farmer_name: principal.display_name.clone(),
						conversation_id,
						is_typing,
					})
					.await;
			}
			PrincipalKind::AutomatedAgent => {
				self.registry
					.broadcast(&Room::User(principal.farmer_id.clone()), ServerEvent::AiTyping {
						conversation_id,
						is_typing,
					})
					.await;
			}
			PrincipalKind::Admin => {}
		}
		Ok(())
	}

	/// Fan out `new_message` to the conversation room and admin monitoring;
	/// agent-authored messages also reach the farmer's personal room.
	async fn broadcast_message(&self, message: &Message, farmer_room: Option<&FarmerId>) {
		let event = ServerEvent::NewMessage {
			message: message.clone(),
		};

		self.registry
			.broadcast(&Room::Conversation(message.conversation_id), event.clone())
			.await;
		self.registry.broadcast(&Room::AdminMonitoring, event.clone()).await;

		if let Some(farmer_id) = farmer_room {
			self.registry.broadcast(&Room::User(farmer_id.clone()), event).await;
		}
	}
}

fn default_content(message_type: MessageType, content: Option<String>, duration: Option<u32>) -> String {
	let content = content.unwrap_or_default();
	if !content.trim().is_empty() {
		return content;
	}

	match message_type {
		MessageType::Image => "Image shared".to_string(),
		MessageType::Voice => format!("Voice message ({}s)", duration.unwrap_or(0)),
		MessageType::Video => format!("Video message ({}s)", duration.unwrap_or(0)),
		_ => content,
	}
}
