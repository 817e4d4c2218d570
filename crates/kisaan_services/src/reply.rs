#![forbid(unsafe_code)]

use kisaan_domain::{Message, MessageType};

use crate::{FarmerContext, ReplyEngine};

/// Keyword-matching reply engine.
///
/// Placeholder for the real content engine; the dispatcher only depends on
/// the `draft` contract (text out, may fail).
#[derive(Default)]
pub struct KeywordReplyEngine;

impl KeywordReplyEngine {
	pub fn new() -> Self {
		Self
	}

	fn text_reply(question: &str, farmer: &FarmerContext) -> String {
		let question = question.to_lowercase();

		let location = farmer.location.as_deref().unwrap_or("your area");
		let responses: [(&str, String); 8] = [
			("weather", format!("Today's weather in {location} is clear. Good time for irrigation.")),
			("pest", "For pest problems, first identify the pest. Send a photo or video for better advice.".to_string()),
			("seed", "Buy seeds only from certified dealers. Which crop seeds do you need?".to_string()),
			("fertilizer", "Apply fertilizer after soil testing. Balance of NPK is important.".to_string()),
			("disease", "Send a photo or video of affected plants for disease identification and treatment advice.".to_string()),
			("market", "Current market prices vary by location. Which crop are you planning to sell?".to_string()),
			("irrigation", "Water your crops early morning or evening. Check soil moisture before watering.".to_string()),
			("harvest", "Harvest time depends on crop maturity. Which crop are you planning to harvest?".to_string()),
		];

		for (keyword, response) in responses {
			if question.contains(keyword) {
				return response;
			}
		}

		"I am here to help you. Please describe your farming issue in detail, or send me photos or videos for better analysis."
			.to_string()
	}

	fn voice_reply(duration_secs: u32) -> String {
		let mut response = format!("I received your voice message ({duration_secs} seconds). ");
		if duration_secs < 5 {
			response.push_str("Could you please provide more details about your farming question?");
		} else if duration_secs > 60 {
			response.push_str("That's quite detailed! Let me address the key points you mentioned.");
		} else {
			response.push_str("Let me help you with your farming concern.");
		}
		response
	}

	fn video_reply(duration_secs: u32) -> String {
		let mut response = format!("I received your video message ({duration_secs} seconds). ");
		if duration_secs < 10 {
			response.push_str(
				"The video is quite short. If you're showing a crop issue, a longer video with different angles would help me analyze better.",
			);
		} else {
			response.push_str("I can see what you've recorded. The plants appear to be in the growth stage. What concerns you about this crop?");
		}
		response
	}
}

#[async_trait::async_trait]
impl ReplyEngine for KeywordReplyEngine {
	async fn draft(&self, message: &Message, farmer: &FarmerContext) -> anyhow::Result<String> {
		let reply = match message.message_type {
			MessageType::Text => Self::text_reply(&message.content, farmer),
			MessageType::Image => {
				"I can see the image you've shared. For detailed analysis, I'll need to examine it more closely. \
				 Can you tell me what specific issue you're facing with this crop?"
					.to_string()
			}
			MessageType::Voice => Self::voice_reply(message.media_duration_secs.unwrap_or(0)),
			MessageType::Video => Self::video_reply(message.media_duration_secs.unwrap_or(0)),
			MessageType::SystemAlert | MessageType::WeatherAlert | MessageType::SchemeAlert => {
				"I received your message. How can I help you with your farming needs?".to_string()
			}
		};

		Ok(reply)
	}
}

/// Welcome message persisted on a farmer's first contact.
pub fn welcome_text(farmer_name: &str) -> String {
	format!(
		"Hello {farmer_name}! I'm your Agricultural Assistant. I can help you with:\n\
		\n\
		- Crop problem solutions\n\
		- Weather updates and advice\n\
		- Pest and disease identification\n\
		- Government scheme information\n\
		- Market prices and selling advice\n\
		\n\
		You can send me:\n\
		- Text messages with your questions\n\
		- Photos of your crops or issues\n\
		- Voice messages (I can understand Hindi and English)\n\
		- Videos showing your farm conditions\n\
		\n\
		Feel free to ask me any farming-related questions!"
	)
}

#[cfg(test)]
mod tests {
	use kisaan_domain::{ConversationId, SenderKind};

	use super::*;
	use crate::{NewMessage, build_message};

	fn message(message_type: MessageType, content: &str, duration: Option<u32>) -> Message {
		let mut msg = NewMessage::text(ConversationId::new_v4(), "f1", SenderKind::Farmer, content);
		msg.message_type = message_type;
		msg.media_duration_secs = duration;
		if message_type.is_media() {
			msg.media_url = Some("https://cdn.example/x".to_string());
		}
		build_message(msg, kisaan_domain::MessageId::new_v4(), 0)
	}

	#[tokio::test]
	async fn keyword_match_beats_fallback() {
		let engine = KeywordReplyEngine::new();
		let farmer = FarmerContext {
			name: "Asha".to_string(),
			location: Some("Nashik".to_string()),
			preferred_language: None,
		};

		let reply = engine
			.draft(&message(MessageType::Text, "how is the weather today", None), &farmer)
			.await
			.unwrap();
		assert!(reply.contains("Nashik"));

		let fallback = engine
			.draft(&message(MessageType::Text, "hello there", None), &farmer)
			.await
			.unwrap();
		assert!(fallback.contains("describe your farming issue"));
	}

	#[tokio::test]
	async fn media_replies_use_duration() {
		let engine = KeywordReplyEngine::new();
		let farmer = FarmerContext::default();

		let short = engine
			.draft(&message(MessageType::Voice, "", Some(2)), &farmer)
			.await
			.unwrap();
		assert!(short.contains("more details"));

		let long = engine
			.draft(&message(MessageType::Video, "", Some(45)), &farmer)
			.await
			.unwrap();
		assert!(long.contains("growth stage"));
	}

	#[test]
	fn welcome_text_mentions_farmer() {
		assert!(welcome_text("Asha").starts_with("Hello Asha!"));
	}
}
