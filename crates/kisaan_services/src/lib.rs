#![forbid(unsafe_code)]

pub mod media;
pub mod memory;
pub mod reply;
pub mod sql;

use core::fmt;

use bytes::Bytes;
use kisaan_domain::{
	AlertType, Conversation, ConversationId, DeliveryStatus, FarmerId, Message, MessageId, MessageType, MimeClass,
	PrincipalKind, SenderKind,
};
use thiserror::Error;

/// Fixed sender id recorded on automated-agent messages.
pub const ASSISTANT_SENDER_ID: &str = "kisaan_sahayak";

/// Display name of the automated assistant.
pub const ASSISTANT_NAME: &str = "Kisaan Sahayak";

/// Errors surfaced by store collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("not found: {0}")]
	NotFound(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("store backend error: {0}")]
	Backend(#[source] anyhow::Error),
}

impl StoreError {
	pub fn backend(err: impl Into<anyhow::Error>) -> Self {
		Self::Backend(err.into())
	}
}

/// Fields for a message about to be appended; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub conversation_id: ConversationId,
	pub sender_id: String,
	pub sender_kind: SenderKind,
	pub message_type: MessageType,
	pub content: String,
	pub media_url: Option<String>,
	pub media_duration_secs: Option<u32>,
	pub media_size_bytes: Option<u64>,
	pub is_proactive: bool,
	pub alert_type: Option<AlertType>,
}

impl NewMessage {
	/// A plain text message.
	pub fn text(conversation_id: ConversationId, sender_id: impl Into<String>, sender_kind: SenderKind, content: impl Into<String>) -> Self {
		Self {
			conversation_id,
			sender_id: sender_id.into(),
			sender_kind,
			message_type: MessageType::Text,
			content: content.into(),
			media_url: None,
			media_duration_secs: None,
			media_size_bytes: None,
			is_proactive: false,
			alert_type: None,
		}
	}

	/// A proactive automated-agent message (alert subtype required).
	pub fn proactive(conversation_id: ConversationId, message_type: MessageType, content: impl Into<String>, alert_type: AlertType) -> Self {
		Self {
			conversation_id,
			sender_id: ASSISTANT_SENDER_ID.to_string(),
			sender_kind: SenderKind::AutomatedAgent,
			message_type,
			content: content.into(),
			media_url: None,
			media_duration_secs: None,
			media_size_bytes: None,
			is_proactive: true,
			alert_type: Some(alert_type),
		}
	}
}

/// Partial update applied to a conversation after an append or counter change.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationPatch {
	pub last_message_id: Option<MessageId>,
	pub touch_activity: bool,
	pub increment_unread: bool,
	pub reset_unread: bool,
	pub increment_total: bool,
	pub set_active: Option<bool>,
}

impl ConversationPatch {
	/// Patch applied after appending `message`: last-message ref, activity, total counter.
	pub fn after_append(message: &Message) -> Self {
		Self {
			last_message_id: Some(message.id),
			touch_activity: true,
			increment_total: true,
			..Self::default()
		}
	}

	pub fn with_unread_increment(mut self) -> Self {
		self.increment_unread = true;
		self
	}
}

/// Document store for conversations and messages.
///
/// The gateway never holds conversations as authoritative in-memory state;
/// every read/update goes through this interface.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn find_conversation(&self, farmer_id: &FarmerId) -> Result<Option<Conversation>, StoreError>;

	/// Create the farmer's conversation; `Conflict` if one already exists.
	async fn create_conversation(&self, farmer_id: &FarmerId) -> Result<Conversation, StoreError>;

	async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError>;

	/// Append a message, assigning id, `Sent` status and timestamp.
	async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError>;

	async fn update_conversation(&self, id: ConversationId, patch: ConversationPatch) -> Result<(), StoreError>;

	/// Transition unread automated-agent messages to read; returns how many
	/// were updated (0 on repeat calls).
	async fn mark_messages_read(&self, id: ConversationId, read_at_unix_ms: i64) -> Result<u64, StoreError>;

	/// Most recent messages, returned in chronological order.
	async fn recent_messages(&self, id: ConversationId, limit: u32) -> Result<Vec<Message>, StoreError>;

	async fn list_active_conversations(&self) -> Result<Vec<Conversation>, StoreError>;
}

/// Profile resolved from the user store at authentication time.
#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
	pub id: String,
	pub name: String,
	pub role: PrincipalKind,
	pub location: Option<String>,
	pub preferred_language: Option<String>,
}

/// Lookup of principals in the user store.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
	async fn find_user(&self, id: &str) -> Result<Option<UserProfile>, StoreError>;
}

/// Farmer details handed to the reply engine for context.
#[derive(Debug, Clone, Default)]
pub struct FarmerContext {
	pub name: String,
	pub location: Option<String>,
	pub preferred_language: Option<String>,
}

impl From<&UserProfile> for FarmerContext {
	fn from(profile: &UserProfile) -> Self {
		Self {
			name: profile.name.clone(),
			location: profile.location.clone(),
			preferred_language: profile.preferred_language.clone(),
		}
	}
}

/// Blob/media submission path (Cloudinary or equivalent).
#[async_trait::async_trait]
pub trait MediaSubmitter: Send + Sync {
	/// Submit a reassembled payload; returns the resolved media URL.
	async fn submit(&self, payload: Bytes, mime_class: MimeClass, owner: &FarmerId) -> anyhow::Result<String>;
}

/// Reply content synthesis; may fail, in which case the dispatcher falls
/// back to a fixed apology.
#[async_trait::async_trait]
pub trait ReplyEngine: Send + Sync {
	async fn draft(&self, message: &Message, farmer: &FarmerContext) -> anyhow::Result<String>;
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Current Unix time in milliseconds.
pub(crate) fn unix_ms_now() -> i64 {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Validate the type-specific payload invariants of a message about to be stored.
pub fn validate_new_message(msg: &NewMessage) -> Result<(), String> {
	match msg.message_type {
		MessageType::Text | MessageType::SystemAlert | MessageType::WeatherAlert | MessageType::SchemeAlert => {
			if msg.content.trim().is_empty() {
				return Err("content is required for text/alert messages".to_string());
			}
		}
		MessageType::Image => {
			if msg.media_url.as_deref().map(str::trim).unwrap_or("").is_empty() {
				return Err("media_url is required for image messages".to_string());
			}
		}
		MessageType::Voice | MessageType::Video => {
			if msg.media_url.as_deref().map(str::trim).unwrap_or("").is_empty() {
				return Err("media_url is required for voice/video messages".to_string());
			}
			if msg.media_duration_secs.is_none() {
				return Err("media_duration_secs is required for voice/video messages".to_string());
			}
		}
	}

	if msg.is_proactive && msg.alert_type.is_none() {
		return Err("alert_type is required for proactive messages".to_string());
	}

	Ok(())
}

/// Build a `Message` record from `NewMessage` fields (shared by store impls).
pub(crate) fn build_message(msg: NewMessage, id: MessageId, created_at_unix_ms: i64) -> Message {
	Message {
		id,
		conversation_id: msg.conversation_id,
		sender_id: msg.sender_id,
		sender_kind: msg.sender_kind,
		message_type: msg.message_type,
		content: msg.content,
		media_url: msg.media_url,
		media_duration_secs: msg.media_duration_secs,
		media_size_bytes: msg.media_size_bytes,
		is_proactive: msg.is_proactive,
		alert_type: msg.alert_type,
		status: DeliveryStatus::Sent,
		read_at_unix_ms: None,
		created_at_unix_ms,
	}
}

/// Apply a patch to a conversation record (shared by store impls).
pub(crate) fn apply_patch(convo: &mut Conversation, patch: ConversationPatch, now_unix_ms: i64) {
	if let Some(last) = patch.last_message_id {
		convo.last_message_id = Some(last);
	}
	if patch.touch_activity {
		convo.last_activity_unix_ms = now_unix_ms;
	}
	if patch.increment_unread {
		convo.unread_count = convo.unread_count.saturating_add(1);
	}
	if patch.reset_unread {
		convo.unread_count = 0;
	}
	if patch.increment_total {
		convo.total_messages = convo.total_messages.saturating_add(1);
	}
	if let Some(active) = patch.set_active {
		convo.active = active;
	}
}

#[cfg(test)]
mod tests {
	use kisaan_domain::ConversationId;

	use super::*;

	#[test]
	fn validates_text_requires_content() {
		let mut msg = NewMessage::text(ConversationId::new_v4(), "f1", SenderKind::Farmer, "   ");
		assert!(validate_new_message(&msg).is_err());

		msg.content = "hello".to_string();
		assert!(validate_new_message(&msg).is_ok());
	}

	#[test]
	fn validates_media_requires_url_and_duration() {
		let mut msg = NewMessage::text(ConversationId::new_v4(), "f1", SenderKind::Farmer, "");
		msg.message_type = MessageType::Voice;
		assert!(validate_new_message(&msg).is_err());

		msg.media_url = Some("https://cdn.example/a.mp3".to_string());
		assert!(validate_new_message(&msg).is_err());

		msg.media_duration_secs = Some(12);
		assert!(validate_new_message(&msg).is_ok());
	}

	#[test]
	fn validates_proactive_requires_alert_type() {
		let mut msg = NewMessage::text(ConversationId::new_v4(), ASSISTANT_SENDER_ID, SenderKind::AutomatedAgent, "alert");
		msg.is_proactive = true;
		assert!(validate_new_message(&msg).is_err());

		msg.alert_type = Some(AlertType::Weather);
		assert!(validate_new_message(&msg).is_ok());
	}

	#[test]
	fn patch_application() {
		let mut convo = Conversation {
			id: ConversationId::new_v4(),
			farmer_id: FarmerId::new("f1").unwrap(),
			last_message_id: None,
			last_activity_unix_ms: 0,
			unread_count: 2,
			total_messages: 5,
			active: true,
			created_at_unix_ms: 0,
		};

		let last = MessageId::new_v4();
		apply_patch(
			&mut convo,
			ConversationPatch {
				last_message_id: Some(last),
				touch_activity: true,
				increment_unread: true,
				increment_total: true,
				..Default::default()
			},
			123,
		);

		assert_eq!(convo.last_message_id, Some(last));
		assert_eq!(convo.last_activity_unix_ms, 123);
		assert_eq!(convo.unread_count, 3);
		assert_eq!(convo.total_messages, 6);

		apply_patch(
			&mut convo,
			ConversationPatch {
				reset_unread: true,
				..Default::default()
			},
			456,
		);
		assert_eq!(convo.unread_count, 0);
		assert_eq!(convo.last_activity_unix_ms, 123);
	}
}
