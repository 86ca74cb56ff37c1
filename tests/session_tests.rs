//! End-to-end session tests against a local in-memory fixture server.
//!
//! These drive the full pipeline (playlist polling, variant selection,
//! segment fetch, decryption, sink writes) over real HTTP and assert the
//! externally observable behavior: what ends up in the sink, in what order,
//! and how often each server path was hit.

use std::time::Duration;

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use restream::{Restream, RestreamError, RestreamResult, RestreamSettings};


use fixture::{CollectSink, Fixture};

fn media_playlist(media_sequence: u64, segments: &[&str]) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:1\n");
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
    for segment in segments {
        out.push_str("#EXTINF:1.0,\n");
        out.push_str(segment);
        out.push('\n');
    }
    out
}

fn test_settings() -> RestreamSettings {
    RestreamSettings::default().with_retry_interval(Duration::from_millis(50))
}

fn spawn_session(
    settings: RestreamSettings,
    sink: CollectSink,
    cancel: CancellationToken,
    url: String,
) -> JoinHandle<RestreamResult<()>> {
    tokio::spawn(async move {
        let session = Restream::new(settings, sink)?;
        session.run(cancel, &url).await
    })
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met within timeout");
}

#[tokio::test]
async fn streams_live_playlist_in_order_exactly_once() {
    let fixture = Fixture::new();
    fixture.put("live.m3u8", media_playlist(1, &["seg1.ts", "seg2.ts", "seg3.ts"]));
    fixture.put("seg1.ts", "ONE");
    fixture.put("seg2.ts", "TWO");
    fixture.put("seg3.ts", "THREE");
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let cancel = CancellationToken::new();
    let handle = spawn_session(
        test_settings(),
        sink.clone(),
        cancel.clone(),
        base.join("live.m3u8").unwrap().to_string(),
    );

    wait_until(|| sink.contents() == b"ONETWOTHREE").await;

    // Simulate the live window sliding forward: one new segment, two repeats.
    fixture.put("seg4.ts", "FOUR");
    fixture.put("live.m3u8", media_playlist(2, &["seg2.ts", "seg3.ts", "seg4.ts"]));

    wait_until(|| sink.contents() == b"ONETWOTHREEFOUR").await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    for segment in ["seg1.ts", "seg2.ts", "seg3.ts", "seg4.ts"] {
        assert_eq!(fixture.request_count(segment), 1, "{segment} refetched");
    }
}

#[tokio::test]
async fn missing_segment_is_terminal_without_retry() {
    let fixture = Fixture::new();
    fixture.put("live.m3u8", media_playlist(1, &["missing.ts"]));
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let handle = spawn_session(
        test_settings(),
        sink.clone(),
        CancellationToken::new(),
        base.join("live.m3u8").unwrap().to_string(),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not terminate")
        .unwrap();

    assert!(matches!(
        result,
        Err(RestreamError::HttpStatus { status: 404, .. })
    ));
    assert_eq!(fixture.request_count("missing.ts"), 1);
    assert!(sink.contents().is_empty());
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let fixture = Fixture::new();
    fixture.put("live.m3u8", media_playlist(1, &["seg1.ts"]));
    fixture.put("seg1.ts", "PAYLOAD");
    fixture.fail_times("seg1.ts", 500, 2);
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let cancel = CancellationToken::new();
    let handle = spawn_session(
        test_settings(),
        sink.clone(),
        cancel.clone(),
        base.join("live.m3u8").unwrap().to_string(),
    );

    wait_until(|| sink.contents() == b"PAYLOAD").await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(fixture.request_count("seg1.ts"), 3);
}

#[tokio::test]
async fn master_playlist_selects_variant_under_ceiling() {
    let fixture = Fixture::new();
    fixture.put(
        "master.m3u8",
        "#EXTM3U\n\
         #EXT-X-VERSION:3\n\
         #EXT-X-STREAM-INF:BANDWIDTH=500000\n\
         v500000.m3u8\n\
         #EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=1280x720\n\
         v1000000.m3u8\n\
         #EXT-X-STREAM-INF:BANDWIDTH=2000000\n\
         v2000000.m3u8\n",
    );
    fixture.put("v1000000.m3u8", media_playlist(1, &["seg1.ts"]));
    fixture.put("seg1.ts", "MID-QUALITY");
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let cancel = CancellationToken::new();
    let handle = spawn_session(
        test_settings().with_max_bandwidth(1_500_000),
        sink.clone(),
        cancel.clone(),
        base.join("master.m3u8").unwrap().to_string(),
    );

    wait_until(|| sink.contents() == b"MID-QUALITY").await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    // The ceiling rules out the 2M variant, the 1M one wins over 500k.
    assert_eq!(fixture.request_count("v500000.m3u8"), 0);
    assert_eq!(fixture.request_count("v2000000.m3u8"), 0);
    assert!(fixture.request_count("v1000000.m3u8") >= 1);
}

#[tokio::test]
async fn aes_segments_are_decrypted() {
    let key = [7u8; 16];
    let iv = [3u8; 16];
    // Trailing 0xab bytes never look like padding, and a length that is a
    // multiple of 16 forces a full padding block for the heuristic to strip.
    let plaintext = vec![0xabu8; 96];
    let ciphertext = cbc::Encryptor::<Aes128>::new_from_slices(&key, &iv)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

    let fixture = Fixture::new();
    fixture.put(
        "live.m3u8",
        format!(
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:1\n\
             #EXT-X-MEDIA-SEQUENCE:1\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x{}\n\
             #EXTINF:1.0,\n\
             seg1.ts\n",
            hex::encode(iv)
        ),
    );
    fixture.put("key.bin", key.to_vec());
    fixture.put("seg1.ts", ciphertext);
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let cancel = CancellationToken::new();
    let handle = spawn_session(
        test_settings(),
        sink.clone(),
        cancel.clone(),
        base.join("live.m3u8").unwrap().to_string(),
    );

    wait_until(|| sink.len() >= 96).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.contents(), plaintext);
    assert_eq!(fixture.request_count("key.bin"), 1);
}

#[tokio::test]
async fn unsupported_key_method_terminates_before_fetching() {
    let fixture = Fixture::new();
    fixture.put(
        "live.m3u8",
        "#EXTM3U\n\
         #EXT-X-VERSION:3\n\
         #EXT-X-TARGETDURATION:1\n\
         #EXT-X-MEDIA-SEQUENCE:1\n\
         #EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"key.bin\"\n\
         #EXTINF:1.0,\n\
         seg1.ts\n",
    );
    fixture.put("seg1.ts", "NEVER SERVED");
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let handle = spawn_session(
        test_settings(),
        sink.clone(),
        CancellationToken::new(),
        base.join("live.m3u8").unwrap().to_string(),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not terminate")
        .unwrap();

    match result {
        Err(RestreamError::UnsupportedKeyMethod(method)) => {
            assert_eq!(method, "SAMPLE-AES");
        }
        other => panic!("expected UnsupportedKeyMethod, got {other:?}"),
    }
    assert!(sink.contents().is_empty());
    assert_eq!(fixture.request_count("seg1.ts"), 0);
}

#[tokio::test]
async fn cancellation_ends_session_cleanly() {
    let fixture = Fixture::new();
    fixture.put("live.m3u8", media_playlist(1, &["seg1.ts"]));
    fixture.put("seg1.ts", "PAYLOAD");
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let cancel = CancellationToken::new();
    let handle = spawn_session(
        test_settings(),
        sink.clone(),
        cancel.clone(),
        base.join("live.m3u8").unwrap().to_string(),
    );

    wait_until(|| !sink.contents().is_empty()).await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not stop after cancellation")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn no_bytes_reach_sink_after_cancellation() {
    let fixture = Fixture::new();
    fixture.put("live.m3u8", media_playlist(1, &["big.ts"]));
    // 8 x 32 KiB served with 100ms pauses, so cancellation lands while the
    // segment is still streaming.
    fixture.trickle("big.ts", 32 * 1024, 8, Duration::from_millis(100));
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let cancel = CancellationToken::new();
    let handle = spawn_session(
        test_settings().with_read_buffer_size(1024),
        sink.clone(),
        cancel.clone(),
        base.join("live.m3u8").unwrap().to_string(),
    );

    wait_until(|| sink.len() >= 32 * 1024).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session did not stop after cancellation")
        .unwrap();
    assert!(result.is_ok());

    // Writes stop at the token: the rest of the segment never lands.
    let frozen = sink.len();
    assert!(frozen < 8 * 32 * 1024, "whole segment written: {frozen}");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.len(), frozen);
}

#[tokio::test]
async fn tiny_queue_preserves_order_and_loses_nothing() {
    let fixture = Fixture::new();
    let segments = ["s1.ts", "s2.ts", "s3.ts", "s4.ts", "s5.ts", "s6.ts"];
    let payloads = ["A", "B", "C", "D", "E", "F"];
    fixture.put("live.m3u8", media_playlist(1, &segments));
    for (segment, payload) in segments.iter().zip(payloads) {
        fixture.put(segment, payload);
    }
    let base = fixture.start().await;

    let sink = CollectSink::new();
    let cancel = CancellationToken::new();
    let handle = spawn_session(
        test_settings().with_queue_capacity(1),
        sink.clone(),
        cancel.clone(),
        base.join("live.m3u8").unwrap().to_string(),
    );

    wait_until(|| sink.contents() == b"ABCDEF").await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    for segment in segments {
        assert_eq!(fixture.request_count(segment), 1, "{segment} refetched");
    }
}
