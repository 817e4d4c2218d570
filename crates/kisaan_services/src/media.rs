#![forbid(unsafe_code)]

use bytes::Bytes;
use kisaan_domain::{FarmerId, MimeClass};
use tracing::debug;

use crate::{MediaSubmitter, unix_ms_now};

/// Media submitter that mints deterministic CDN-style URLs without uploading.
///
/// Stands in for the real blob storage integration; the gateway only needs
/// a resolved URL back.
pub struct SimulatedMediaSubmitter {
	base_url: String,
}

impl SimulatedMediaSubmitter {
	pub fn new(base_url: impl Into<String>) -> Self {
		let mut base_url = base_url.into();
		while base_url.ends_with('/') {
			base_url.pop();
		}
		Self { base_url }
	}
}

impl Default for SimulatedMediaSubmitter {
	fn default() -> Self {
		Self::new("https://media.kisaan.local")
	}
}

#[async_trait::async_trait]
impl MediaSubmitter for SimulatedMediaSubmitter {
	async fn submit(&self, payload: Bytes, mime_class: MimeClass, owner: &FarmerId) -> anyhow::Result<String> {
		if payload.is_empty() {
			anyhow::bail!("refusing to submit empty media payload");
		}

		let (folder, ext) = match mime_class {
			MimeClass::Image => ("image", "jpg"),
			MimeClass::Voice => ("audio", "mp3"),
			MimeClass::Video => ("video", "mp4"),
		};

		let url = format!("{}/{}/upload/v{}/{}_{}.{}", self.base_url, folder, unix_ms_now(), owner, folder, ext);

		debug!(owner = %owner, class = ?mime_class, bytes = payload.len(), "media payload submitted");
		Ok(url)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn submit_returns_url_per_class() {
		let submitter = SimulatedMediaSubmitter::new("https://cdn.example/");
		let owner = FarmerId::new("f1").unwrap();

		let url = submitter
			.submit(Bytes::from_static(b"abc"), MimeClass::Voice, &owner)
			.await
			.unwrap();
		assert!(url.starts_with("https://cdn.example/audio/upload/v"));
		assert!(url.ends_with("f1_audio.mp3"));
	}

	#[tokio::test]
	async fn submit_rejects_empty_payload() {
		let submitter = SimulatedMediaSubmitter::default();
		let owner = FarmerId::new("f1").unwrap();
		assert!(submitter.submit(Bytes::new(), MimeClass::Image, &owner).await.is_err());
	}
}
