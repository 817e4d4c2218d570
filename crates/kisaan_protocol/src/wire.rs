#![forbid(unsafe_code)]

use core::fmt;

use kisaan_domain::{AlertType, Conversation, ConversationId, FarmerId, Message, MessageType, PrincipalKind, UploadId};
use serde::{Deserialize, Serialize};

/// v1 protocol version written into every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire envelope around a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<E> {
	pub version: u32,

	/// Client-chosen correlation id, echoed back on acks and errors.
	#[serde(default)]
	pub request_id: String,

	pub event: E,
}

impl<E> Envelope<E> {
	pub fn new(event: E) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			event,
		}
	}

	pub fn with_request_id(event: E, request_id: impl Into<String>) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			request_id: request_id.into(),
			event,
		}
	}
}

/// Frame sent by clients.
pub type ClientFrame = Envelope<ClientEvent>;

/// Frame sent by the gateway.
pub type ServerFrame = Envelope<ServerEvent>;

/// Stable error kinds carried on `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Authentication,
	NotRegistered,
	Ownership,
	Validation,
	UnknownSession,
	Persistence,
}

impl ErrorKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorKind::Authentication => "authentication",
			ErrorKind::NotRegistered => "not_registered",
			ErrorKind::Ownership => "ownership",
			ErrorKind::Validation => "validation",
			ErrorKind::UnknownSession => "unknown_session",
			ErrorKind::Persistence => "persistence",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Inbound events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
	/// Must be the first frame on a connection.
	Hello {
		auth_token: String,
	},

	/// Join (lazily creating) the caller's conversation with the assistant.
	JoinConversation,

	SendMessage {
		conversation_id: ConversationId,
		message_type: MessageType,
		#[serde(default)]
		content: Option<String>,
		#[serde(default)]
		media_url: Option<String>,
		#[serde(default)]
		media_duration_secs: Option<u32>,
		#[serde(default)]
		media_size_bytes: Option<u64>,
	},

	/// One chunk of a large media upload; `chunk_data` is base64.
	UploadChunk {
		upload_id: UploadId,
		chunk_index: u32,
		chunk_data: String,
		total_chunks: u32,
		mime_type: String,
		conversation_id: ConversationId,
	},

	CancelUpload {
		upload_id: UploadId,
	},

	TypingStart {
		conversation_id: ConversationId,
	},

	TypingStop {
		conversation_id: ConversationId,
	},

	MarkMessagesRead {
		conversation_id: ConversationId,
	},

	/// Admin / automated-agent only.
	SendProactiveMessage {
		farmer_id: FarmerId,
		content: String,
		alert_type: AlertType,
		#[serde(default)]
		message_type: Option<MessageType>,
	},

	/// Admin only; fans out to every active conversation.
	BroadcastEmergency {
		content: String,
		alert_type: AlertType,
	},

	/// Admin only; opts into the monitoring room.
	AdminMonitorAll,

	GetPresence,

	Ping {
		client_time_unix_ms: i64,
	},
}

/// Outbound events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	Welcome {
		server_name: String,
		principal_kind: PrincipalKind,
		display_name: String,
		farmer_id: FarmerId,
		server_time_unix_ms: i64,
		max_frame_bytes: u32,
	},

	ConversationJoined {
		conversation: Conversation,
		/// Recent history, chronological order.
		messages: Vec<Message>,
	},

	NewMessage {
		message: Message,
	},

	/// Ack for the sender's own `send_message`.
	MessageSent {
		message: Message,
	},

	UploadProgress {
		upload_id: UploadId,
		percent: f32,
	},

	UploadComplete {
		upload_id: UploadId,
		message: Message,
	},

	UploadCancelled {
		upload_id: UploadId,
	},

	UploadError {
		upload_id: UploadId,
		kind: ErrorKind,
		detail: String,
	},

	ProactiveAlert {
		message: Message,
		alert_type: AlertType,
	},

	/// Ack for the admin's `send_proactive_message`.
	ProactiveSent {
		message: Message,
	},

	EmergencyAlert {
		message: Message,
		alert_type: AlertType,
	},

	/// Ack for the admin's `broadcast_emergency`, with per-conversation outcome counts.
	EmergencyBroadcastResult {
		delivered: u32,
		failed: u32,
	},

	AiTyping {
		conversation_id: ConversationId,
		is_typing: bool,
	},

	/// Relayed to the admin-monitoring room only.
	FarmerTyping {
		farmer_id: FarmerId,
		farmer_name: String,
		conversation_id: ConversationId,
		is_typing: bool,
	},

	MessagesMarkedRead {
		conversation_id: ConversationId,
		updated: u64,
	},

	Presence {
		snapshot: PresenceSnapshot,
	},

	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},

	/// Generic ack for events with no richer response.
	Ack,

	Error {
		kind: ErrorKind,
		message: String,
	},
}

/// Read-only presence snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceSnapshot {
	pub total_connections: usize,
	pub farmers: Vec<PresencePeer>,
	pub admins: Vec<PresencePeer>,
	pub agents: Vec<PresencePeer>,
}

/// One online principal in a presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePeer {
	pub principal_id: String,
	pub display_name: String,
	pub farmer_id: FarmerId,
	pub connected_at_unix_ms: i64,
}
