#![forbid(unsafe_code)]

use std::sync::Arc;

use kisaan_domain::{AlertType, MessageType, Room, SenderKind};
use kisaan_protocol::ServerEvent;
use kisaan_services::MessageStore;

use crate::server::error::GatewayError;
use crate::server::router::SendRequest;
use crate::server::test_support::{
	FlakyStore, Harness, admin_principal, agent_principal, drain_events, farmer, farmer_principal, wait_for_event,
};

fn text_request(conversation_id: kisaan_domain::ConversationId, content: &str) -> SendRequest {
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
async fn first_contact_creates_conversation_and_welcome() {
	let harness = Harness::new();
	harness.directory.insert_farmer("f1", "Asha").await;

	let principal = farmer_principal("f1", "Asha");
	let mut rx = harness.attach(1, &principal).await;

	let (conversation, messages) = harness.router.join_conversation(1, &principal).await.unwrap();

	assert_eq!(conversation.farmer_id, farmer("f1"));
	assert_eq!(conversation.unread_count, 1);
	assert_eq!(conversation.total_messages, 1);
	assert!(conversation.active);

	assert_eq!(messages.len(), 1);
	let welcome = &messages[0];
	assert!(welcome.is_proactive);
	assert_eq!(welcome.alert_type, Some(AlertType::Welcome));
	assert_eq!(welcome.sender_kind, SenderKind::AutomatedAgent);
	assert!(welcome.content.starts_with("Hello Asha!"));

	// The welcome also lands in the farmer's personal room.
	let event = wait_for_event(&mut rx, |e| matches!(e, ServerEvent::NewMessage { .. })).await;
	match event {
		ServerEvent::NewMessage { message } => assert_eq!(message.id, welcome.id),
		other => panic!("unexpected event: {other:?}"),
	}

	// Rejoining neither duplicates the conversation nor the welcome.
	let (again, messages) = harness.router.join_conversation(1, &principal).await.unwrap();
	assert_eq!(again.id, conversation.id);
	assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn admins_cannot_join_or_send_chat_messages() {
	let harness = Harness::new();
	let admin = admin_principal("a1");
	let _rx = harness.attach(1, &admin).await;

	assert!(matches!(
		harness.router.join_conversation(1, &admin).await.unwrap_err(),
		GatewayError::Ownership(_)
	));

	let err = harness.send(&admin, text_request(kisaan_domain::ConversationId::new_v4(), "hi"))
		.await
		.unwrap_err();
	assert!(matches!(err, GatewayError::Ownership(_)), "got: {err:?}");
}

#[tokio::test]
async fn send_message_persists_once_and_broadcasts_to_every_room_member() {
	let harness = Harness::new();
	harness.directory.insert_farmer("f1", "Asha").await;
	let principal = farmer_principal("f1", "Asha");

	// Two devices of the same farmer, both joined to the conversation room.
	let mut rx1 = harness.attach(1, &principal).await;
	let mut rx2 = harness.attach(2, &principal).await;
	let (conversation, _) = harness.router.join_conversation(1, &principal).await.unwrap();
	harness.router.join_conversation(2, &principal).await.unwrap();

	let outcome = harness.send(&principal, text_request(conversation.id, "namaste"))
		.await
		.unwrap();
	assert_eq!(outcome.message.content, "namaste");
	assert_eq!(outcome.message.sender_kind, SenderKind::Farmer);

	outcome.reply_task.expect("farmer messages schedule a reply").await.unwrap();

	// Welcome + farmer message + automated reply.
	assert_eq!(harness.store.message_count().await, 3);

	for rx in [&mut rx1, &mut rx2] {
		let events = drain_events(rx);
		let copies = events
			.iter()
			.filter(|e| matches!(e, ServerEvent::NewMessage { message } if message.content == "namaste"))
			.count();
		assert_eq!(copies, 1, "expected exactly one copy per room member");
	}
}

#[tokio::test]
async fn farmer_message_triggers_agent_reply_in_order() {
	let harness = Harness::new();
	harness.directory.insert_farmer("f1", "Asha").await;
	let principal = farmer_principal("f1", "Asha");

	let mut rx = harness.attach(1, &principal).await;
	let (conversation, _) = harness.router.join_conversation(1, &principal).await.unwrap();

	let outcome = harness.send(&principal, text_request(conversation.id, "how is the weather"))
		.await
		.unwrap();
	outcome.reply_task.unwrap().await.unwrap();

	let messages = harness.store.recent_messages(conversation.id, 10).await.unwrap();
	assert_eq!(messages.len(), 3);
	assert_eq!(messages[1].sender_kind, SenderKind::Farmer);
	assert_eq!(messages[1].content, "how is the weather");
	assert_eq!(messages[2].sender_kind, SenderKind::AutomatedAgent);
	assert!(!messages[2].content.is_empty());

	// Typing indicator brackets the reply on the farmer's personal room.
	let events = drain_events(&mut rx);
	let typing_on = events
		.iter()
		.position(|e| matches!(e, ServerEvent::AiTyping { is_typing: true, .. }));
	let reply_pos = events
		.iter()
		.position(|e| matches!(e, ServerEvent::NewMessage { message } if message.id == messages[2].id));
	let typing_off = events
		.iter()
		.position(|e| matches!(e, ServerEvent::AiTyping { is_typing: false, .. }));

	let (on, reply, off) = (
		typing_on.expect("ai_typing true"),
		reply_pos.expect("reply broadcast"),
		typing_off.expect("ai_typing false"),
	);
	assert!(on < reply && reply < off, "got order {on} {reply} {off}");
}

#[tokio::test]
async fn invalid_payloads_are_rejected_without_persistence_or_broadcast() {
	let harness = Harness::new();
	let principal = farmer_principal("f1", "Asha");
	let mut rx = harness.attach(1, &principal).await;
	let (conversation, _) = harness.router.join_conversation(1, &principal).await.unwrap();
	drain_events(&mut rx);

	let blank = SendRequest {
		content: Some("   ".to_string()),
		..text_request(conversation.id, "")
	};
	assert!(matches!(
		harness.send(&principal, blank).await.unwrap_err(),
		GatewayError::Validation(_)
	));

	let image_without_url = SendRequest {
		message_type: MessageType::Image,
		content: None,
		..text_request(conversation.id, "")
	};
	assert!(matches!(
		harness.send(&principal, image_without_url).await.unwrap_err(),
		GatewayError::Validation(_)
	));

	// Only the welcome exists; nothing new was broadcast.
	assert_eq!(harness.store.message_count().await, 1);
	assert!(
		drain_events(&mut rx)
			.iter()
			.all(|e| !matches!(e, ServerEvent::NewMessage { .. }))
	);
}

#[tokio::test]
async fn mark_read_is_idempotent() {
	let harness = Harness::new();
	harness.directory.insert_farmer("f1", "Asha").await;
	let principal = farmer_principal("f1", "Asha");
	let _rx = harness.attach(1, &principal).await;

	let (conversation, _) = harness.router.join_conversation(1, &principal).await.unwrap();
	let outcome = harness.send(&principal, text_request(conversation.id, "hello"))
		.await
		.unwrap();
	outcome.reply_task.unwrap().await.unwrap();

	// Welcome + automated reply are unread agent messages.
	assert_eq!(harness.router.mark_read(&principal, conversation.id).await.unwrap(), 2);
	assert_eq!(harness.router.mark_read(&principal, conversation.id).await.unwrap(), 0);

	let conversation = harness.store.get_conversation(conversation.id).await.unwrap().unwrap();
	assert_eq!(conversation.unread_count, 0);
}

#[tokio::test]
async fn mark_read_enforces_conversation_ownership() {
	let harness = Harness::new();
	let owner = farmer_principal("f1", "Asha");
	let _rx = harness.attach(1, &owner).await;
	let (conversation, _) = harness.router.join_conversation(1, &owner).await.unwrap();

	let stranger = farmer_principal("f2", "Binod");
	assert!(matches!(
		harness.router.mark_read(&stranger, conversation.id).await.unwrap_err(),
		GatewayError::Ownership(_)
	));

	// Admins may mark any conversation.
	assert!(harness.router.mark_read(&admin_principal("a1"), conversation.id).await.is_ok());
}

#[tokio::test]
async fn send_proactive_is_admin_or_agent_only() {
	let harness = Harness::new();
	let principal = farmer_principal("f1", "Asha");
	let mut rx = harness.attach(1, &principal).await;
	let (conversation, _) = harness.router.join_conversation(1, &principal).await.unwrap();
	drain_events(&mut rx);

	let message = harness
		.router
		.send_proactive(&admin_principal("a1"), &farmer("f1"), "Heavy rain expected".to_string(), AlertType::Weather, None)
		.await
		.unwrap();
	assert!(message.is_proactive);
	assert_eq!(message.alert_type, Some(AlertType::Weather));
	assert_eq!(message.message_type, MessageType::WeatherAlert);

	let event = wait_for_event(&mut rx, |e| matches!(e, ServerEvent::ProactiveAlert { .. })).await;
	match event {
		ServerEvent::ProactiveAlert { message: alert, alert_type } => {
			assert_eq!(alert.id, message.id);
			assert_eq!(alert_type, AlertType::Weather);
		}
		other => panic!("unexpected event: {other:?}"),
	}

	// Welcome plus the proactive alert are both unread.
	let conversation = harness.store.get_conversation(conversation.id).await.unwrap().unwrap();
	assert_eq!(conversation.unread_count, 2);

	// The agent may also push proactive messages; farmers may not.
	assert!(
		harness
			.router
			.send_proactive(&agent_principal("f1"), &farmer("f1"), "Crop stage update".to_string(), AlertType::CropStage, None)
			.await
			.is_ok()
	);
	assert!(matches!(
		harness
			.router
			.send_proactive(&principal, &farmer("f1"), "nope".to_string(), AlertType::Weather, None)
			.await
			.unwrap_err(),
		GatewayError::Ownership(_)
	));
}

#[tokio::test]
async fn send_proactive_requires_an_existing_conversation() {
	let harness = Harness::new();
	assert!(matches!(
		harness
			.router
			.send_proactive(&admin_principal("a1"), &farmer("ghost"), "hello".to_string(), AlertType::Weather, None)
			.await
			.unwrap_err(),
		GatewayError::Validation(_)
	));
}

#[tokio::test]
async fn broadcast_emergency_continues_past_per_conversation_failures() {
	let backing = Arc::new(kisaan_services::memory::MemoryMessageStore::new());
	let flaky = Arc::new(FlakyStore::new(Arc::clone(&backing)));
	let harness = Harness::with_store(Arc::clone(&flaky) as Arc<dyn MessageStore>, Arc::clone(&backing));

	let mut receivers = Vec::new();
	let mut conversations = Vec::new();
	for i in 1..=5u64 {
		let id = format!("f{i}");
		let principal = farmer_principal(&id, &format!("Farmer {i}"));
		let mut rx = harness.attach(i, &principal).await;
		let (conversation, _) = harness.router.join_conversation(i, &principal).await.unwrap();
		drain_events(&mut rx);
		receivers.push(rx);
		conversations.push(conversation);
	}

	flaky.fail_appends_for(conversations[2].id).await;

	let (delivered, failed) = harness
		.router
		.broadcast_emergency(&admin_principal("a1"), "Flood warning for the district", AlertType::Emergency)
		.await
		.unwrap();
	assert_eq!((delivered, failed), (4, 1));

	for (i, rx) in receivers.iter_mut().enumerate() {
		let got_alert = drain_events(rx)
			.iter()
			.any(|e| matches!(e, ServerEvent::EmergencyAlert { .. }));
		if i == 2 {
			assert!(!got_alert, "failed conversation must not receive the alert");
		} else {
			assert!(got_alert, "conversation {i} missed the alert");
		}
	}
}

#[tokio::test]
async fn broadcast_emergency_is_admin_only_and_validates_content() {
	let harness = Harness::new();

	assert!(matches!(
		harness
			.router
			.broadcast_emergency(&agent_principal("f1"), "x", AlertType::Emergency)
			.await
			.unwrap_err(),
		GatewayError::Ownership(_)
	));

	assert!(matches!(
		harness
			.router
			.broadcast_emergency(&admin_principal("a1"), "   ", AlertType::Emergency)
			.await
			.unwrap_err(),
		GatewayError::Validation(_)
	));
}

#[tokio::test]
async fn typing_relays_reach_only_their_rooms() {
	let harness = Harness::new();
	let principal = farmer_principal("f1", "Asha");
	let mut farmer_rx = harness.attach(1, &principal).await;

	let admin = admin_principal("a1");
	let mut admin_rx = harness.attach(2, &admin).await;
	harness.registry.join(2, Room::AdminMonitoring).await.unwrap();

	let conversation_id = kisaan_domain::ConversationId::new_v4();

	harness.router.typing(&principal, conversation_id, true).await.unwrap();
	assert!(harness.registry.is_typing(&farmer("f1")).await);

	let event = wait_for_event(&mut admin_rx, |e| matches!(e, ServerEvent::FarmerTyping { .. })).await;
	match event {
		ServerEvent::FarmerTyping {
			farmer_id,
			farmer_name,
			is_typing,
			..
		} => {
			assert_eq!(farmer_id, farmer("f1"));
			assert_eq!(farmer_name, "Asha");
			assert!(is_typing);
		}
		other => panic!("unexpected event: {other:?}"),
	}
	assert!(drain_events(&mut farmer_rx).is_empty(), "farmer must not see own typing relay");

	harness.router.typing(&principal, conversation_id, false).await.unwrap();
	assert!(!harness.registry.is_typing(&farmer("f1")).await);

	// Agent typing goes to the farmer's personal room only.
	harness.router.typing(&agent_principal("f1"), conversation_id, true).await.unwrap();
	let event = wait_for_event(&mut farmer_rx, |e| matches!(e, ServerEvent::AiTyping { .. })).await;
	assert!(matches!(event, ServerEvent::AiTyping { is_typing: true, .. }));
}
