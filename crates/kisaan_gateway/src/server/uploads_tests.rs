#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use kisaan_domain::{ConversationId, MimeClass, UploadId};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use crate::server::error::GatewayError;
use crate::server::test_support::farmer;
use crate::server::uploads::{ChunkFrame, ChunkOutcome, UploadConfig, UploadReassembler};

fn reassembler() -> UploadReassembler {
	UploadReassembler::new(UploadConfig::default())
}

fn upload_id(s: &str) -> UploadId {
	UploadId::new(s).expect("valid UploadId")
}

fn chunk_body(index: u32) -> Vec<u8> {
	vec![b'a' + (index % 26) as u8; 4]
}

fn chunk(id: &str, index: u32, total: u32, data: &[u8], convo: ConversationId) -> ChunkFrame {
	ChunkFrame {
		upload_id: upload_id(id),
		chunk_index: index,
		data: Bytes::copy_from_slice(data),
		total_chunks: total,
		mime_type: "image/png".to_string(),
		conversation_id: convo,
	}
}

#[tokio::test]
async fn chunks_reassemble_in_index_order() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();
	let owner = farmer("f1");

	match uploads.ingest_chunk(1, &owner, chunk("u1", 0, 3, b"aa", convo)).await.unwrap() {
		ChunkOutcome::Progress { received, total } => {
			assert_eq!((received, total), (1, 3));
		}
		other => panic!("expected progress, got: {other:?}"),
	}

	// Duplicate delivery of the same index overwrites rather than duplicates.
	uploads.ingest_chunk(1, &owner, chunk("u1", 2, 3, b"xx", convo)).await.unwrap();
	uploads.ingest_chunk(1, &owner, chunk("u1", 2, 3, b"cc", convo)).await.unwrap();

	match uploads.ingest_chunk(1, &owner, chunk("u1", 1, 3, b"bb", convo)).await.unwrap() {
		ChunkOutcome::Completed(completed) => {
			assert_eq!(&completed.payload[..], b"aabbcc");
			assert_eq!(completed.mime_class, MimeClass::Image);
			assert_eq!(completed.conversation_id, convo);
			assert_eq!(completed.owner_farmer, owner);
		}
		other => panic!("expected completion, got: {other:?}"),
	}
}

#[tokio::test]
async fn finished_session_rejects_late_chunks() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();
	let owner = farmer("f1");

	uploads.ingest_chunk(1, &owner, chunk("u1", 0, 1, b"all", convo)).await.unwrap();

	let err = uploads.ingest_chunk(1, &owner, chunk("u1", 0, 1, b"late", convo)).await.unwrap_err();
	assert!(matches!(err, GatewayError::UnknownSession(_)), "got: {err:?}");
}

#[tokio::test]
async fn first_chunk_must_carry_index_zero() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();

	let err = uploads
		.ingest_chunk(1, &farmer("f1"), chunk("u1", 1, 3, b"bb", convo))
		.await
		.unwrap_err();
	assert!(matches!(err, GatewayError::UnknownSession(_)), "got: {err:?}");
}

#[tokio::test]
async fn zero_total_chunks_is_rejected_at_open() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();

	let err = uploads
		.ingest_chunk(1, &farmer("f1"), chunk("u1", 0, 0, b"", convo))
		.await
		.unwrap_err();
	assert!(matches!(err, GatewayError::Validation(_)), "got: {err:?}");
}

#[tokio::test]
async fn out_of_range_index_is_rejected() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();
	let owner = farmer("f1");

	uploads.ingest_chunk(1, &owner, chunk("u1", 0, 2, b"aa", convo)).await.unwrap();

	let err = uploads.ingest_chunk(1, &owner, chunk("u1", 2, 2, b"zz", convo)).await.unwrap_err();
	assert!(matches!(err, GatewayError::Validation(_)), "got: {err:?}");
}

#[tokio::test]
async fn unsupported_mime_type_is_rejected() {
	let uploads = reassembler();
	let mut frame = chunk("u1", 0, 2, b"aa", ConversationId::new_v4());
	frame.mime_type = "application/pdf".to_string();

	let err = uploads.ingest_chunk(1, &farmer("f1"), frame).await.unwrap_err();
	assert!(matches!(err, GatewayError::Validation(_)), "got: {err:?}");
}

#[tokio::test]
async fn chunks_from_another_connection_are_rejected() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();
	let owner = farmer("f1");

	uploads.ingest_chunk(1, &owner, chunk("u1", 0, 2, b"aa", convo)).await.unwrap();

	let err = uploads.ingest_chunk(2, &owner, chunk("u1", 1, 2, b"bb", convo)).await.unwrap_err();
	assert!(matches!(err, GatewayError::Ownership(_)), "got: {err:?}");
}

#[tokio::test]
async fn cancel_discards_partial_data() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();
	let owner = farmer("f1");

	uploads.ingest_chunk(1, &owner, chunk("u1", 0, 2, b"aa", convo)).await.unwrap();

	// Only the owner may cancel.
	assert!(matches!(
		uploads.cancel(&upload_id("u1"), 2).await.unwrap_err(),
		GatewayError::Ownership(_)
	));

	uploads.cancel(&upload_id("u1"), 1).await.unwrap();
	assert_eq!(uploads.active_count().await, 0);

	assert!(matches!(
		uploads.ingest_chunk(1, &owner, chunk("u1", 1, 2, b"bb", convo)).await.unwrap_err(),
		GatewayError::UnknownSession(_)
	));

	assert!(matches!(
		uploads.cancel(&upload_id("u1"), 1).await.unwrap_err(),
		GatewayError::UnknownSession(_)
	));
}

#[tokio::test]
async fn disconnect_cancels_every_owned_session() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();
	let owner = farmer("f1");

	uploads.ingest_chunk(1, &owner, chunk("u1", 0, 2, b"aa", convo)).await.unwrap();
	uploads.ingest_chunk(1, &owner, chunk("u2", 0, 3, b"bb", convo)).await.unwrap();
	uploads.ingest_chunk(2, &farmer("f2"), chunk("u3", 0, 2, b"cc", convo)).await.unwrap();

	let mut cancelled = uploads.cancel_all_for(1).await;
	cancelled.sort_by(|a, b| a.as_str().cmp(b.as_str()));
	assert_eq!(cancelled, vec![upload_id("u1"), upload_id("u2")]);
	assert_eq!(uploads.active_count().await, 1);

	for id in ["u1", "u2"] {
		let err = uploads.ingest_chunk(1, &owner, chunk(id, 1, 2, b"zz", convo)).await.unwrap_err();
		assert!(matches!(err, GatewayError::UnknownSession(_)), "got: {err:?}");
	}
}

#[tokio::test]
async fn idle_sessions_are_reclaimed_like_a_disconnect() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();
	let owner = farmer("f1");

	uploads.ingest_chunk(1, &owner, chunk("u1", 0, 2, b"aa", convo)).await.unwrap();

	let reclaimed = uploads.reclaim_idle(Duration::from_secs(0)).await;
	assert_eq!(reclaimed, vec![upload_id("u1")]);
	assert_eq!(uploads.active_count().await, 0);

	assert!(matches!(
		uploads.ingest_chunk(1, &owner, chunk("u1", 1, 2, b"bb", convo)).await.unwrap_err(),
		GatewayError::UnknownSession(_)
	));
}

#[tokio::test]
async fn reclaim_leaves_fresh_sessions_alone() {
	let uploads = reassembler();
	let convo = ConversationId::new_v4();

	uploads.ingest_chunk(1, &farmer("f1"), chunk("u1", 0, 2, b"aa", convo)).await.unwrap();

	assert!(uploads.reclaim_idle(Duration::from_secs(3600)).await.is_empty());
	assert_eq!(uploads.active_count().await, 1);
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(64))]

	/// Reassembly completes with the payload in index order for any arrival
	/// permutation, including a duplicate somewhere in the stream.
	#[test]
	fn any_arrival_permutation_completes(
		total in 2u32..10,
		order_seed in proptest::collection::vec(any::<u32>(), 10),
		dup_pos in any::<proptest::sample::Index>(),
	) {
		let mut order: Vec<u32> = (0..total).collect();
		// Fisher-Yates driven by the seed values.
		for i in (1..order.len()).rev() {
			let j = (order_seed[i % order_seed.len()] as usize) % (i + 1);
			order.swap(i, j);
		}
		// Index 0 must arrive first to open the session.
		if let Some(pos) = order.iter().position(|&i| i == 0) {
			order.swap(0, pos);
		}
		let dup = order[dup_pos.index(order.len())];
		order.push(dup);

		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.expect("build runtime");

		rt.block_on(async move {
			let uploads = reassembler();
			let convo = ConversationId::new_v4();
			let owner = farmer("f1");

			let mut completed = None;
			for (pos, index) in order.iter().copied().enumerate() {
				let outcome = uploads
					.ingest_chunk(1, &owner, chunk("u1", index, total, &chunk_body(index), convo))
					.await;

				match outcome {
					Ok(ChunkOutcome::Completed(done)) => {
						completed = Some(done);
						// Everything after completion is a stale retry.
						prop_assert!(pos >= total as usize - 1);
					}
					Ok(ChunkOutcome::Progress { .. }) => {
						prop_assert!(completed.is_none());
					}
					Err(GatewayError::UnknownSession(_)) => {
						prop_assert!(completed.is_some(), "unknown session before completion");
					}
					Err(e) => return Err(TestCaseError::fail(format!("unexpected error: {e:?}"))),
				}
			}

			let done = completed.expect("upload completed");
			let mut expected = Vec::new();
			for index in 0..total {
				expected.extend_from_slice(&chunk_body(index));
			}
			prop_assert_eq!(&done.payload[..], &expected[..]);
			Ok(())
		})?;
	}
}
