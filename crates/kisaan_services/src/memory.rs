#![forbid(unsafe_code)]

use std::collections::HashMap;

use kisaan_domain::{Conversation, ConversationId, DeliveryStatus, FarmerId, Message, MessageId, PrincipalKind, SenderKind};
use tokio::sync::{Mutex, RwLock};

use crate::{ConversationPatch, MessageStore, NewMessage, StoreError, UserDirectory, UserProfile, apply_patch, build_message, unix_ms_now};

/// In-memory message store, used when persistence is disabled and in tests.
#[derive(Default)]
pub struct MemoryMessageStore {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	conversations: HashMap<ConversationId, Conversation>,
	by_farmer: HashMap<FarmerId, ConversationId>,
	messages: HashMap<ConversationId, Vec<Message>>,
}

impl MemoryMessageStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Total number of stored messages across all conversations (test helper).
	pub async fn message_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.messages.values().map(Vec::len).sum()
	}
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
	async fn find_conversation(&self, farmer_id: &FarmerId) -> Result<Option<Conversation>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner
			.by_farmer
			.get(farmer_id)
			.and_then(|id| inner.conversations.get(id))
			.cloned())
	}

	async fn create_conversation(&self, farmer_id: &FarmerId) -> Result<Conversation, StoreError> {
		let mut inner = self.inner.lock().await;
		if inner.by_farmer.contains_key(farmer_id) {
			return Err(StoreError::Conflict(format!("conversation exists for farmer {farmer_id}")));
		}

		let now = unix_ms_now();
		let convo = Conversation {
			id: ConversationId::new_v4(),
			farmer_id: farmer_id.clone(),
			last_message_id: None,
			last_activity_unix_ms: now,
			unread_count: 0,
			total_messages: 0,
			active: true,
			created_at_unix_ms: now,
		};

		inner.by_farmer.insert(farmer_id.clone(), convo.id);
		inner.conversations.insert(convo.id, convo.clone());
		Ok(convo)
	}

	async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.conversations.get(&id).cloned())
	}

	async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
		let mut inner = self.inner.lock().await;
		if !inner.conversations.contains_key(&msg.conversation_id) {
			return Err(StoreError::NotFound(format!("conversation {}", msg.conversation_id)));
		}

		let message = build_message(msg, MessageId::new_v4(), unix_ms_now());
		inner
			.messages
			.entry(message.conversation_id)
			.or_default()
			.push(message.clone());
		Ok(message)
	}

	async fn update_conversation(&self, id: ConversationId, patch: ConversationPatch) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		let Some(convo) = inner.conversations.get_mut(&id) else {
			return Err(StoreError::NotFound(format!("conversation {id}")));
		};
		apply_patch(convo, patch, unix_ms_now());
		Ok(())
	}

	async fn mark_messages_read(&self, id: ConversationId, read_at_unix_ms: i64) -> Result<u64, StoreError> {
		let mut inner = self.inner.lock().await;
		if !inner.conversations.contains_key(&id) {
			return Err(StoreError::NotFound(format!("conversation {id}")));
		}

		let mut updated = 0u64;
		if let Some(messages) = inner.messages.get_mut(&id) {
			for msg in messages.iter_mut() {
				if msg.sender_kind == SenderKind::AutomatedAgent && msg.status != DeliveryStatus::Read {
					msg.status = DeliveryStatus::Read;
					msg.read_at_unix_ms = Some(read_at_unix_ms);
					updated += 1;
				}
			}
		}

		if let Some(convo) = inner.conversations.get_mut(&id) {
			convo.unread_count = 0;
		}

		Ok(updated)
	}

	async fn recent_messages(&self, id: ConversationId, limit: u32) -> Result<Vec<Message>, StoreError> {
		let inner = self.inner.lock().await;
		let Some(messages) = inner.messages.get(&id) else {
			return Ok(Vec::new());
		};

		let start = messages.len().saturating_sub(limit as usize);
		Ok(messages[start..].to_vec())
	}

	async fn list_active_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
		let inner = self.inner.lock().await;
		let mut convos: Vec<Conversation> = inner.conversations.values().filter(|c| c.active).cloned().collect();
		convos.sort_by_key(|c| c.created_at_unix_ms);
		Ok(convos)
	}
}

/// In-memory user directory, seeded explicitly.
#[derive(Default)]
pub struct MemoryUserDirectory {
	users: RwLock<HashMap<String, UserProfile>>,
}

impl MemoryUserDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert(&self, profile: UserProfile) {
		let mut users = self.users.write().await;
		users.insert(profile.id.clone(), profile);
	}

	/// Convenience seeding for dev/test setups.
	pub async fn insert_farmer(&self, id: &str, name: &str) {
		self.insert(UserProfile {
			id: id.to_string(),
			name: name.to_string(),
			role: PrincipalKind::Farmer,
			location: None,
			preferred_language: None,
		})
		.await;
	}

	pub async fn insert_admin(&self, id: &str, name: &str) {
		self.insert(UserProfile {
			id: id.to_string(),
			name: name.to_string(),
			role: PrincipalKind::Admin,
			location: None,
			preferred_language: None,
		})
		.await;
	}
}

#[async_trait::async_trait]
impl UserDirectory for MemoryUserDirectory {
	async fn find_user(&self, id: &str) -> Result<Option<UserProfile>, StoreError> {
		let users = self.users.read().await;
		Ok(users.get(id).cloned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn farmer(id: &str) -> FarmerId {
		FarmerId::new(id).expect("valid FarmerId")
	}

	#[tokio::test]
	async fn create_conversation_is_unique_per_farmer() {
		let store = MemoryMessageStore::new();
		let f = farmer("f1");

		let convo = store.create_conversation(&f).await.unwrap();
		assert!(matches!(
			store.create_conversation(&f).await,
			Err(StoreError::Conflict(_))
		));

		let found = store.find_conversation(&f).await.unwrap().unwrap();
		assert_eq!(found.id, convo.id);
		assert!(found.active);
	}

	#[tokio::test]
	async fn mark_read_is_idempotent() {
		let store = MemoryMessageStore::new();
		let convo = store.create_conversation(&farmer("f1")).await.unwrap();

		let mut msg = NewMessage::text(convo.id, crate::ASSISTANT_SENDER_ID, SenderKind::AutomatedAgent, "hello");
		store.append_message(msg.clone()).await.unwrap();
		msg.content = "again".to_string();
		store.append_message(msg).await.unwrap();

		store
			.update_conversation(
				convo.id,
				ConversationPatch {
					increment_unread: true,
					..Default::default()
				},
			)
			.await
			.unwrap();

		assert_eq!(store.mark_messages_read(convo.id, 1_000).await.unwrap(), 2);
		assert_eq!(store.mark_messages_read(convo.id, 2_000).await.unwrap(), 0);

		let convo = store.get_conversation(convo.id).await.unwrap().unwrap();
		assert_eq!(convo.unread_count, 0);

		// read timestamps are not re-stamped by the second call
		let messages = store.recent_messages(convo.id, 10).await.unwrap();
		assert!(messages.iter().all(|m| m.read_at_unix_ms == Some(1_000)));
	}

	#[tokio::test]
	async fn recent_messages_returns_chronological_tail() {
		let store = MemoryMessageStore::new();
		let convo = store.create_conversation(&farmer("f1")).await.unwrap();

		for n in 0..5 {
			store
				.append_message(NewMessage::text(convo.id, "f1", SenderKind::Farmer, format!("m{n}")))
				.await
				.unwrap();
		}

		let tail = store.recent_messages(convo.id, 2).await.unwrap();
		let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
		assert_eq!(contents, vec!["m3", "m4"]);
	}

	#[tokio::test]
	async fn append_requires_existing_conversation() {
		let store = MemoryMessageStore::new();
		let err = store
			.append_message(NewMessage::text(ConversationId::new_v4(), "f1", SenderKind::Farmer, "hi"))
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::NotFound(_)));
	}
}
