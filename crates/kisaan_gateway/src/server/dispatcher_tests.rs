#![forbid(unsafe_code)]

use std::sync::Arc;

use kisaan_domain::{MessageType, SenderKind};
use kisaan_protocol::ServerEvent;
use kisaan_services::MessageStore;

use crate::server::dispatcher::FALLBACK_APOLOGY;
use crate::server::router::SendRequest;
use crate::server::test_support::{
	FailingReplyEngine, FlakyStore, GatedReplyEngine, Harness, drain_events, farmer_principal, wait_for_event,
};

fn text(conversation_id: kisaan_domain::ConversationId, content: &str) -> SendRequest {
	SendRequest {
		conversation_id,
		message_type: MessageType::Text,
		content: Some(content.to_string()),
		media_url: None,
		media_duration_secs: None,
		media_size_bytes: None,
	}
}

#[tokio::test]
async fn engine_failure_falls_back_to_apology() {
	let harness = Harness::with_engine(Arc::new(FailingReplyEngine));
	let principal = farmer_principal("f1", "Asha");
	let mut rx = harness.attach(1, &principal).await;
	let (conversation, _) = harness.router.join_conversation(1, &principal).await.unwrap();

	// The caller's acknowledgment is unaffected by the broken engine.
	let outcome = harness.send(&principal, text(conversation.id, "help me"))
		.await
		.unwrap();
	assert_eq!(outcome.message.content, "help me");

	outcome.reply_task.unwrap().await.unwrap();

	let messages = harness.store.recent_messages(conversation.id, 10).await.unwrap();
	let reply = messages.last().unwrap();
	assert_eq!(reply.sender_kind, SenderKind::AutomatedAgent);
	assert_eq!(reply.content, FALLBACK_APOLOGY);

	// The apology is broadcast like any reply, never as an error event.
	let event = wait_for_event(&mut rx, |e| {
		matches!(e, ServerEvent::NewMessage { message } if message.content == FALLBACK_APOLOGY)
	})
	.await;
	assert!(matches!(event, ServerEvent::NewMessage { .. }));
	assert!(
		drain_events(&mut rx)
			.iter()
			.all(|e| !matches!(e, ServerEvent::Error { .. }))
	);
}

#[tokio::test]
async fn typing_indicator_brackets_the_reply_even_on_failure() {
	let harness = Harness::with_engine(Arc::new(FailingReplyEngine));
	let principal = farmer_principal("f1", "Asha");
	let mut rx = harness.attach(1, &principal).await;
	let (conversation, _) = harness.router.join_conversation(1, &principal).await.unwrap();

	let outcome = harness.send(&principal, text(conversation.id, "anyone there"))
		.await
		.unwrap();
	outcome.reply_task.unwrap().await.unwrap();

	let events = drain_events(&mut rx);
	let on = events
		.iter()
		.position(|e| matches!(e, ServerEvent::AiTyping { is_typing: true, .. }));
	let off = events
		.iter()
		.position(|e| matches!(e, ServerEvent::AiTyping { is_typing: false, .. }));
	assert!(on.expect("typing on") < off.expect("typing off"));
}

#[tokio::test]
async fn reply_persistence_failure_is_contained() {
	let backing = Arc::new(kisaan_services::memory::MemoryMessageStore::new());
	let flaky = Arc::new(FlakyStore::new(Arc::clone(&backing)));
	let engine = Arc::new(GatedReplyEngine::default());
	let harness = Harness::with_store_and_engine(
		Arc::clone(&flaky) as Arc<dyn MessageStore>,
		Arc::clone(&backing),
		Arc::clone(&engine) as Arc<dyn kisaan_services::ReplyEngine>,
	);

	let principal = farmer_principal("f1", "Asha");
	let mut rx = harness.attach(1, &principal).await;
	let (conversation, _) = harness.router.join_conversation(1, &principal).await.unwrap();

	let outcome = harness.send(&principal, text(conversation.id, "hello"))
		.await
		.unwrap();

	// The farmer message is durable before the reply append starts failing.
	flaky.set_fail_all_appends(true);
	engine.release();
	outcome.reply_task.unwrap().await.unwrap();

	// Welcome + farmer message only; the lost reply is not broadcast and the
	// triggering send stays acknowledged.
	assert_eq!(harness.store.message_count().await, 2);
	let events = drain_events(&mut rx);
	assert!(
		events
			.iter()
			.all(|e| !matches!(e, ServerEvent::NewMessage { message } if message.content == "gated reply")),
		"a reply that failed to persist must not be broadcast"
	);
	assert!(
		events
			.iter()
			.any(|e| matches!(e, ServerEvent::AiTyping { is_typing: false, .. })),
		"typing indicator must still be cleared"
	);
}
