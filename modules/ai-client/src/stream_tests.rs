//! Streaming session tests: frame decoding, accumulation, watchdogs and abort.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;

use super::*;

fn frame(content: &str) -> Bytes {
    let body = json!({"id": "gen-1", "choices": [{"delta": {"content": content}}]});
    Bytes::from(format!("data: {body}\n\n"))
}

fn reasoning_frame(reasoning: &str) -> Bytes {
    let body = json!({"id": "gen-1", "choices": [{"delta": {"reasoning": reasoning}}]});
    Bytes::from(format!("data: {body}\n\n"))
}

fn done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

fn byte_stream(chunks: Vec<Bytes>, stall: bool) -> BoxStream<'static, Result<Bytes, AiError>> {
    let head = stream::iter(chunks.into_iter().map(Ok));
    if stall {
        head.chain(stream::pending()).boxed()
    } else {
        head.boxed()
    }
}

/// Start a session over canned chunks, recording every running total the
/// chunk callback sees.
fn start(
    chunks: Vec<Bytes>,
    stall: bool,
    limits: StreamLimits,
) -> (StreamingSession, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let on_chunk: ChunkCallback = Box::new(move |progress| {
        sink.lock().unwrap().push(progress.content.to_string());
    });
    let body = byte_stream(chunks, stall);
    let session = StreamingSession::spawn(async move { Ok(body) }, on_chunk, limits);
    (session, seen)
}

#[tokio::test(start_paused = true)]
async fn accumulates_deltas_until_done_marker() {
    let (session, seen) = start(
        vec![frame("Looks fine. "), frame("SCORE_7"), done()],
        true,
        StreamLimits::default(),
    );

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.content, "Looks fine. SCORE_7");
    assert_eq!(completion.end, StreamEnd::Done);
    assert_eq!(completion.generation_id.as_deref(), Some("gen-1"));
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["Looks fine. ".to_string(), "Looks fine. SCORE_7".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn frames_split_across_network_chunks_are_reassembled() {
    let whole = frame("split across chunks");
    let (left, right) = whole.split_at(17);
    let (session, _) = start(
        vec![
            Bytes::copy_from_slice(left),
            Bytes::copy_from_slice(right),
            done(),
        ],
        false,
        StreamLimits::default(),
    );

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.content, "split across chunks");
}

#[tokio::test(start_paused = true)]
async fn newline_only_chunk_terminates_the_buffered_frame() {
    let first = frame("Looks fine. ");
    let body = first.strip_suffix(b"\n\n").unwrap();
    let (session, seen) = start(
        vec![
            Bytes::copy_from_slice(body),
            Bytes::from_static(b"\n\n"),
            frame("SCORE_7"),
            done(),
        ],
        true,
        StreamLimits::default(),
    );

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.content, "Looks fine. SCORE_7");
    assert_eq!(completion.end, StreamEnd::Done);
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn trailing_newlines_of_a_frame_do_not_count_as_empty_chunks() {
    let limits = StreamLimits {
        max_empty_chunks: 1,
        ..StreamLimits::default()
    };
    let first = frame("a");
    let body = first.strip_suffix(b"\n\n").unwrap();
    let (session, _) = start(
        vec![
            Bytes::copy_from_slice(body),
            Bytes::from_static(b"\n"),
            frame("b"),
            done(),
        ],
        false,
        limits,
    );

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.end, StreamEnd::Done);
    assert_eq!(completion.content, "ab");
}

#[tokio::test(start_paused = true)]
async fn reasoning_is_kept_apart_from_content() {
    let (session, _) = start(
        vec![reasoning_frame("thinking. "), frame("SCORE_3"), done()],
        false,
        StreamLimits::default(),
    );

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.reasoning, "thinking. ");
    assert_eq!(completion.content, "SCORE_3");
}

#[tokio::test(start_paused = true)]
async fn stall_after_one_chunk_completes_with_partial_result() {
    let (session, seen) = start(vec![frame("half an ans")], true, StreamLimits::default());

    let completion = session.finish().await.unwrap();
    assert!(completion.timed_out());
    assert_eq!(completion.content, "half an ans");
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn consecutive_empty_chunks_end_the_stream() {
    let blank = || Bytes::from_static(b"\n");
    let (session, _) = start(
        vec![frame("partial"), blank(), blank(), blank()],
        true,
        StreamLimits::default(),
    );

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.end, StreamEnd::EmptyChunks);
    assert_eq!(completion.content, "partial");
}

#[tokio::test(start_paused = true)]
async fn empty_run_resets_on_real_data() {
    let blank = || Bytes::from_static(b"\n");
    let (session, _) = start(
        vec![blank(), blank(), frame("a"), blank(), blank(), frame("b"), done()],
        false,
        StreamLimits::default(),
    );

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.end, StreamEnd::Done);
    assert_eq!(completion.content, "ab");
}

#[tokio::test(start_paused = true)]
async fn abort_yields_single_aborted_outcome() {
    let (session, _) = start(vec![frame("stale")], true, StreamLimits::default());
    let handle = session.abort_handle();

    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.abort();
    handle.abort();

    let completion = session.finish().await.unwrap();
    assert!(completion.aborted());
    assert!(!completion.timed_out());
    assert!(handle.is_aborted());
}

#[tokio::test(start_paused = true)]
async fn abort_after_completion_does_not_change_outcome() {
    let (session, _) = start(vec![frame("x"), done()], false, StreamLimits::default());
    let handle = session.abort_handle();

    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.abort();

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.end, StreamEnd::Done);
}

#[tokio::test(start_paused = true)]
async fn overall_timeout_fires_when_connection_never_opens() {
    let limits = StreamLimits {
        overall: Duration::from_secs(5),
        ..StreamLimits::default()
    };
    let on_chunk: ChunkCallback = Box::new(|_| {});
    let session = StreamingSession::spawn(
        async {
            std::future::pending::<()>().await;
            Ok(byte_stream(Vec::new(), false))
        },
        on_chunk,
        limits,
    );

    let err = session.finish().await.unwrap_err();
    assert!(matches!(err, AiError::Timeout(_)));
}

#[tokio::test(start_paused = true)]
async fn overall_timeout_wins_over_a_trickling_stream() {
    let limits = StreamLimits {
        overall: Duration::from_secs(5),
        inactivity: Duration::from_secs(30),
        max_empty_chunks: 3,
    };
    let trickle = stream::unfold(0u32, |n| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Some((Ok::<_, AiError>(frame(&n.to_string())), n + 1))
    })
    .boxed();
    let on_chunk: ChunkCallback = Box::new(|_| {});
    let session = StreamingSession::spawn(async move { Ok(trickle) }, on_chunk, limits);

    assert!(matches!(
        session.finish().await,
        Err(AiError::Timeout(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_skipped() {
    let (session, _) = start(
        vec![
            Bytes::from_static(b"data: {not json\n\n"),
            frame("SCORE_4"),
            done(),
        ],
        false,
        StreamLimits::default(),
    );

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.content, "SCORE_4");
}

#[tokio::test(start_paused = true)]
async fn closed_connection_keeps_accumulated_text() {
    let (session, _) = start(vec![frame("no done marker")], false, StreamLimits::default());

    let completion = session.finish().await.unwrap();
    assert_eq!(completion.end, StreamEnd::Closed);
    assert_eq!(completion.content, "no done marker");
}

#[tokio::test(start_paused = true)]
async fn transport_error_mid_stream_is_an_error_outcome() {
    let body = stream::iter(vec![
        Ok(frame("a")),
        Err(AiError::Network("connection reset".into())),
    ])
    .boxed();
    let on_chunk: ChunkCallback = Box::new(|_| {});
    let session = StreamingSession::spawn(async move { Ok(body) }, on_chunk, StreamLimits::default());

    assert!(matches!(session.finish().await, Err(AiError::Network(_))));
}

#[test]
fn decoder_ignores_comments_and_blank_lines() {
    let mut decoder = SseDecoder::default();
    let events = decoder.push(b": OPENROUTER PROCESSING\r\n\r\ndata: {\"a\":1}\r\ndata: [DONE]\n");
    assert_eq!(
        events,
        vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
    );
}

#[test]
fn decoder_holds_partial_line_until_newline() {
    let mut decoder = SseDecoder::default();
    assert!(decoder.push(b"data: {\"a\"").is_empty());
    assert_eq!(
        decoder.push(b":2}\n"),
        vec![SseEvent::Data("{\"a\":2}".to_string())]
    );
    assert_eq!(decoder.finish(), None);
}
