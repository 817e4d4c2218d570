#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown variant: {0}")]
	UnknownVariant(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Kinds of authenticated principals on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
	Farmer,
	Admin,
	AutomatedAgent,
}

impl PrincipalKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			PrincipalKind::Farmer => "farmer",
			PrincipalKind::Admin => "admin",
			PrincipalKind::AutomatedAgent => "automated_agent",
		}
	}
}

impl fmt::Display for PrincipalKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for PrincipalKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"farmer" => Ok(PrincipalKind::Farmer),
			"admin" => Ok(PrincipalKind::Admin),
			"automated_agent" | "ai_agent" | "agent" => Ok(PrincipalKind::AutomatedAgent),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Who authored a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
	Farmer,
	#[serde(rename = "ai_agent")]
	AutomatedAgent,
}

impl SenderKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			SenderKind::Farmer => "farmer",
			SenderKind::AutomatedAgent => "ai_agent",
		}
	}
}

impl fmt::Display for SenderKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SenderKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"farmer" => Ok(SenderKind::Farmer),
			"ai_agent" => Ok(SenderKind::AutomatedAgent),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Message payload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
	Text,
	Image,
	Voice,
	Video,
	SystemAlert,
	WeatherAlert,
	SchemeAlert,
}

impl MessageType {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageType::Text => "text",
			MessageType::Image => "image",
			MessageType::Voice => "voice",
			MessageType::Video => "video",
			MessageType::SystemAlert => "system_alert",
			MessageType::WeatherAlert => "weather_alert",
			MessageType::SchemeAlert => "scheme_alert",
		}
	}

	/// Whether this type carries a media URL rather than plain text.
	pub const fn is_media(self) -> bool {
		matches!(self, MessageType::Image | MessageType::Voice | MessageType::Video)
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"text" => Ok(MessageType::Text),
			"image" => Ok(MessageType::Image),
			"voice" => Ok(MessageType::Voice),
			"video" => Ok(MessageType::Video),
			"system_alert" => Ok(MessageType::SystemAlert),
			"weather_alert" => Ok(MessageType::WeatherAlert),
			"scheme_alert" => Ok(MessageType::SchemeAlert),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Subtype attached to proactive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
	Welcome,
	Weather,
	GovernmentScheme,
	CropStage,
	PestWarning,
	Emergency,
}

impl AlertType {
	pub const fn as_str(self) -> &'static str {
		match self {
			AlertType::Welcome => "welcome",
			AlertType::Weather => "weather",
			AlertType::GovernmentScheme => "government_scheme",
			AlertType::CropStage => "crop_stage",
			AlertType::PestWarning => "pest_warning",
			AlertType::Emergency => "emergency",
		}
	}
}

impl fmt::Display for AlertType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AlertType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"welcome" => Ok(AlertType::Welcome),
			"weather" => Ok(AlertType::Weather),
			"government_scheme" | "scheme" => Ok(AlertType::GovernmentScheme),
			"crop_stage" => Ok(AlertType::CropStage),
			"pest_warning" | "pest" => Ok(AlertType::PestWarning),
			"emergency" => Ok(AlertType::Emergency),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Delivery state of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
	Sent,
	Delivered,
	Read,
}

impl DeliveryStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			DeliveryStatus::Sent => "sent",
			DeliveryStatus::Delivered => "delivered",
			DeliveryStatus::Read => "read",
		}
	}
}

impl fmt::Display for DeliveryStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for DeliveryStatus {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"sent" => Ok(DeliveryStatus::Sent),
			"delivered" => Ok(DeliveryStatus::Delivered),
			"read" => Ok(DeliveryStatus::Read),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Coarse media classification derived from a declared MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MimeClass {
	Image,
	Voice,
	Video,
}

impl MimeClass {
	/// Classify a MIME string by its top-level type.
	pub fn classify(mime: &str) -> Option<Self> {
		let mime = mime.trim().to_ascii_lowercase();
		if mime.starts_with("image/") {
			Some(MimeClass::Image)
		} else if mime.starts_with("audio/") {
			Some(MimeClass::Voice)
		} else if mime.starts_with("video/") {
			Some(MimeClass::Video)
		} else {
			None
		}
	}

	/// The message type minted for a completed upload of this class.
	pub const fn message_type(self) -> MessageType {
		match self {
			MimeClass::Image => MessageType::Image,
			MimeClass::Voice => MessageType::Voice,
			MimeClass::Video => MessageType::Video,
		}
	}
}

/// Identifier of a farmer account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FarmerId(String);

impl FarmerId {
	/// Create a non-empty `FarmerId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for FarmerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for FarmerId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		FarmerId::new(s.to_string())
	}
}

/// Identifier of a conversation (one per farmer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub uuid::Uuid);

impl ConversationId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat("expected a UUID conversation id".into()))
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat("expected a UUID message id".into()))
	}
}

/// Client-supplied identifier for an in-flight chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
	/// Create a non-empty `UploadId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for UploadId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UploadId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UploadId::new(s.to_string())
	}
}

/// Named broadcast group of connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Room {
	/// A farmer's personal room; proactive alerts and agent traffic land here.
	User(FarmerId),
	/// One conversation between a farmer and the assistant.
	Conversation(ConversationId),
	/// Automated-agent room scoped to one farmer.
	Agent(FarmerId),
	/// Admins who opted into monitoring all conversations.
	AdminMonitoring,
}

impl Room {
	/// Format a room name (e.g. `user:f-42`, `admin:monitoring`).
	pub fn name(&self) -> String {
		match self {
			Room::User(farmer) => format!("user:{farmer}"),
			Room::Conversation(id) => format!("conversation:{id}"),
			Room::Agent(farmer) => format!("agent:{farmer}"),
			Room::AdminMonitoring => "admin:monitoring".to_string(),
		}
	}

	/// Parse a room name produced by [`Room::name`].
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (prefix, rest) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected <kind>:<id>".into()))?;

		match prefix {
			"user" => Ok(Room::User(FarmerId::new(rest.to_string())?)),
			"conversation" => Ok(Room::Conversation(rest.parse()?)),
			"agent" => Ok(Room::Agent(FarmerId::new(rest.to_string())?)),
			"admin" if rest == "monitoring" => Ok(Room::AdminMonitoring),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

impl fmt::Display for Room {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.name())
	}
}

impl From<Room> for String {
	fn from(room: Room) -> Self {
		room.name()
	}
}

impl TryFrom<String> for Room {
	type Error = ParseIdError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		Room::parse(&s)
	}
}

impl FromStr for Room {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Room::parse(s)
	}
}

/// Durable conversation record, one per farmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
	pub id: ConversationId,
	pub farmer_id: FarmerId,
	pub last_message_id: Option<MessageId>,
	/// Unix milliseconds of the last append or counter update.
	pub last_activity_unix_ms: i64,
	pub unread_count: u32,
	pub total_messages: u64,
	pub active: bool,
	pub created_at_unix_ms: i64,
}

/// Durable append-only message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub conversation_id: ConversationId,
	pub sender_id: String,
	pub sender_kind: SenderKind,
	pub message_type: MessageType,
	pub content: String,
	pub media_url: Option<String>,
	pub media_duration_secs: Option<u32>,
	pub media_size_bytes: Option<u64>,
	pub is_proactive: bool,
	/// Required iff `is_proactive`.
	pub alert_type: Option<AlertType>,
	pub status: DeliveryStatus,
	pub read_at_unix_ms: Option<i64>,
	pub created_at_unix_ms: i64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn principal_kind_parse_and_display() {
		assert_eq!("farmer".parse::<PrincipalKind>().unwrap(), PrincipalKind::Farmer);
		assert_eq!("AI_AGENT".parse::<PrincipalKind>().unwrap(), PrincipalKind::AutomatedAgent);
		assert_eq!(PrincipalKind::Admin.to_string(), "admin");
	}

	#[test]
	fn message_type_roundtrip() {
		for t in [
			MessageType::Text,
			MessageType::Image,
			MessageType::Voice,
			MessageType::Video,
			MessageType::SystemAlert,
			MessageType::WeatherAlert,
			MessageType::SchemeAlert,
		] {
			assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
		}
	}

	#[test]
	fn mime_classification() {
		assert_eq!(MimeClass::classify("image/jpeg"), Some(MimeClass::Image));
		assert_eq!(MimeClass::classify("AUDIO/ogg"), Some(MimeClass::Voice));
		assert_eq!(MimeClass::classify("video/mp4"), Some(MimeClass::Video));
		assert_eq!(MimeClass::classify("application/pdf"), None);
		assert_eq!(MimeClass::classify(""), None);
	}

	#[test]
	fn room_name_roundtrip() {
		let farmer = FarmerId::new("f-42").unwrap();
		let convo = ConversationId::new_v4();

		for room in [
			Room::User(farmer.clone()),
			Room::Conversation(convo),
			Room::Agent(farmer),
			Room::AdminMonitoring,
		] {
			let parsed = Room::parse(&room.name()).unwrap();
			assert_eq!(parsed, room);
		}
	}

	#[test]
	fn room_rejects_garbage() {
		assert!(Room::parse("").is_err());
		assert!(Room::parse("user:").is_err());
		assert!(Room::parse("admin:everything").is_err());
		assert!(Room::parse("lobby").is_err());
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(FarmerId::new("").is_err());
		assert!(UploadId::new("   ").is_err());
		assert!("".parse::<ConversationId>().is_err());
	}
}
