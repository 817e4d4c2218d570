#![forbid(unsafe_code)]

use std::sync::Arc;

use kisaan_domain::{Conversation, Message, Room};
use kisaan_protocol::ServerEvent;
use kisaan_services::FarmerContext;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::server::router::MessageRouter;

/// Reply persisted when content generation fails; never surfaced as an error
/// to the farmer.
pub const FALLBACK_APOLOGY: &str =
	"Sorry, I'm having trouble replying right now. Please try again in a little while.";

/// Produce and emit the automated reply to a farmer message.
///
/// Runs as a detached task after the triggering message is durably stored and
/// broadcast; a slow or failing generation never backpressures the sender.
/// The returned handle is dropped by production callers and awaited in tests.
pub fn spawn(router: Arc<MessageRouter>, conversation: Conversation, farmer_message: Message) -> JoinHandle<()> {
	tokio::spawn(async move {
		let farmer_id = conversation.farmer_id.clone();
		let user_room = Room::User(farmer_id.clone());

		router
			.registry
			.broadcast(&user_room, ServerEvent::AiTyping {
				conversation_id: conversation.id,
				is_typing: true,
			})
			.await;

		let farmer = match router.directory.find_user(farmer_id.as_str()).await {
			Ok(Some(profile)) => FarmerContext::from(&profile),
			Ok(None) => FarmerContext::default(),
			Err(e) => {
				warn!(farmer = %farmer_id, error = %e, "reply dispatch: farmer lookup failed");
				FarmerContext::default()
			}
		};

		let text = match router.engine.draft(&farmer_message, &farmer).await {
			Ok(text) => text,
			Err(e) => {
				metrics::counter!("kisaan_gateway_reply_generation_failures_total").increment(1);
				warn!(conversation = %conversation.id, error = %e, "reply generation failed; sending fallback");
				FALLBACK_APOLOGY.to_string()
			}
		};

		match router.persist_agent_reply(conversation.id, text).await {
			Ok(reply) => {
				debug!(conversation = %conversation.id, reply = %reply.id, "automated reply emitted");
			}
			Err(e) => {
				// The original send was already acknowledged; the lost reply
				// only gets operational visibility.
				error!(conversation = %conversation.id, error = %e, "failed to persist automated reply");
			}
		}

		router
			.registry
			.broadcast(&user_room, ServerEvent::AiTyping {
				conversation_id: conversation.id,
				is_typing: false,
			})
			.await;
	})
}
