#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kisaan_domain::{Conversation, ConversationId, FarmerId, Message, PrincipalKind};
use kisaan_protocol::{ServerEvent, ServerFrame};
use kisaan_services::memory::{MemoryMessageStore, MemoryUserDirectory};
use kisaan_services::reply::KeywordReplyEngine;
use kisaan_services::{ConversationPatch, FarmerContext, MessageStore, NewMessage, ReplyEngine, StoreError};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::timeout;

use crate::server::error::GatewayError;
use crate::server::registry::{Principal, RegistryConfig, RoomRegistry};
use crate::server::router::{MessageRouter, RouterConfig, SendOutcome, SendRequest};

pub fn farmer(id: &str) -> FarmerId {
	FarmerId::new(id).expect("valid FarmerId")
}

pub fn farmer_principal(id: &str, name: &str) -> Principal {
	Principal {
		kind: PrincipalKind::Farmer,
		principal_id: id.to_string(),
		display_name: name.to_string(),
		farmer_id: farmer(id),
	}
}

pub fn admin_principal(id: &str) -> Principal {
	Principal {
		kind: PrincipalKind::Admin,
		principal_id: id.to_string(),
		display_name: "Administrator".to_string(),
		farmer_id: farmer(id),
	}
}

pub fn agent_principal(served_farmer: &str) -> Principal {
	Principal {
		kind: PrincipalKind::AutomatedAgent,
		principal_id: kisaan_services::ASSISTANT_SENDER_ID.to_string(),
		display_name: kisaan_services::ASSISTANT_NAME.to_string(),
		farmer_id: farmer(served_farmer),
	}
}

/// Message store wrapper that fails `append_message` on demand.
pub struct FlakyStore {
	inner: Arc<MemoryMessageStore>,
	fail_appends_for: Mutex<HashSet<ConversationId>>,
	fail_all_appends: AtomicBool,
}

impl FlakyStore {
	pub fn new(inner: Arc<MemoryMessageStore>) -> Self {
		Self {
			inner,
			fail_appends_for: Mutex::new(HashSet::new()),
			fail_all_appends: AtomicBool::new(false),
		}
	}

	pub async fn fail_appends_for(&self, conversation_id: ConversationId) {
		let mut set = self.fail_appends_for.lock().await;
		set.insert(conversation_id);
	}

	pub fn set_fail_all_appends(&self, fail: bool) {
		self.fail_all_appends.store(fail, Ordering::SeqCst);
	}
}

#[async_trait::async_trait]
impl MessageStore for FlakyStore {
	async fn find_conversation(&self, farmer_id: &FarmerId) -> Result<Option<Conversation>, StoreError> {
		self.inner.find_conversation(farmer_id).await
	}

	async fn create_conversation(&self, farmer_id: &FarmerId) -> Result<Conversation, StoreError> {
		self.inner.create_conversation(farmer_id).await
	}

	async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
		self.inner.get_conversation(id).await
	}

	async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
		if self.fail_all_appends.load(Ordering::SeqCst) {
			return Err(StoreError::backend(anyhow::anyhow!("injected append failure")));
		}
		{
			let set = self.fail_appends_for.lock().await;
			if set.contains(&msg.conversation_id) {
				return Err(StoreError::backend(anyhow::anyhow!("injected append failure")));
			}
		}
		self.inner.append_message(msg).await
	}

	async fn update_conversation(&self, id: ConversationId, patch: ConversationPatch) -> Result<(), StoreError> {
		self.inner.update_conversation(id, patch).await
	}

	async fn mark_messages_read(&self, id: ConversationId, read_at_unix_ms: i64) -> Result<u64, StoreError> {
		self.inner.mark_messages_read(id, read_at_unix_ms).await
	}

	async fn recent_messages(&self, id: ConversationId, limit: u32) -> Result<Vec<Message>, StoreError> {
		self.inner.recent_messages(id, limit).await
	}

	async fn list_active_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
		self.inner.list_active_conversations().await
	}
}

/// Reply engine that always fails.
pub struct FailingReplyEngine;

#[async_trait::async_trait]
impl ReplyEngine for FailingReplyEngine {
	async fn draft(&self, _message: &Message, _farmer: &FarmerContext) -> anyhow::Result<String> {
		Err(anyhow::anyhow!("content engine unavailable"))
	}
}

/// Reply engine that blocks `draft` until released.
#[derive(Default)]
pub struct GatedReplyEngine {
	gate: Notify,
}

impl GatedReplyEngine {
	pub fn release(&self) {
		self.gate.notify_one();
	}
}

#[async_trait::async_trait]
impl ReplyEngine for GatedReplyEngine {
	async fn draft(&self, _message: &Message, _farmer: &FarmerContext) -> anyhow::Result<String> {
		self.gate.notified().await;
		Ok("gated reply".to_string())
	}
}

/// Fully wired router over in-memory collaborators.
pub struct Harness {
	pub store: Arc<MemoryMessageStore>,
	pub directory: Arc<MemoryUserDirectory>,
	pub registry: Arc<RoomRegistry>,
	pub router: Arc<MessageRouter>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_engine(Arc::new(KeywordReplyEngine::new()))
	}

	pub fn with_engine(engine: Arc<dyn ReplyEngine>) -> Self {
		let store = Arc::new(MemoryMessageStore::new());
		Self::with_store_and_engine(Arc::clone(&store) as Arc<dyn MessageStore>, store, engine)
	}

	pub fn with_store(store: Arc<dyn MessageStore>, backing: Arc<MemoryMessageStore>) -> Self {
		Self::with_store_and_engine(store, backing, Arc::new(KeywordReplyEngine::new()))
	}

	pub fn with_store_and_engine(
		store: Arc<dyn MessageStore>,
		backing: Arc<MemoryMessageStore>,
		engine: Arc<dyn ReplyEngine>,
	) -> Self {
		let directory = Arc::new(MemoryUserDirectory::new());
		let registry = Arc::new(RoomRegistry::new(RegistryConfig::default()));
		let router = Arc::new(MessageRouter::new(
			store,
			Arc::clone(&directory) as Arc<dyn kisaan_services::UserDirectory>,
			engine,
			Arc::clone(&registry),
			RouterConfig::default(),
		));

		Self {
			store: backing,
			directory,
			registry,
			router,
		}
	}

	/// Route one message through the shared router.
	pub async fn send(&self, principal: &Principal, req: SendRequest) -> Result<SendOutcome, GatewayError> {
		Arc::clone(&self.router).send_message(principal, req).await
	}

	/// Register a connection and return its outbound queue receiver.
	pub async fn attach(&self, conn_id: u64, principal: &Principal) -> mpsc::Receiver<ServerFrame> {
		let (tx, rx) = mpsc::channel(64);
		self.registry.register(conn_id, principal.clone(), tx).await;
		rx
	}
}

/// Next outbound event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerEvent {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected an outbound event within timeout")
		.expect("outbound channel open")
		.event
}

/// Drain everything currently queued, without waiting.
pub fn drain_events(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerEvent> {
	let mut events = Vec::new();
	while let Ok(frame) = rx.try_recv() {
		events.push(frame.event);
	}
	events
}

/// Wait (bounded) for an event matching `pred`, discarding everything else.
pub async fn wait_for_event(
	rx: &mut mpsc::Receiver<ServerFrame>,
	pred: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
	timeout(Duration::from_secs(2), async {
		loop {
			let frame = rx.recv().await.expect("outbound channel open");
			if pred(&frame.event) {
				return frame.event;
			}
		}
	})
	.await
	.expect("expected a matching event within timeout")
}
