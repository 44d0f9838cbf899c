//! Integration tests for the buffering and delivery engine.
//!
//! Tests acquisition retries, buffer readiness, paced delivery, pausing,
//! live catch-up and scratch directory cleanup.

mod common;

use common::*;
use std::{sync::Arc, time::Duration};

const WAIT: Duration = Duration::from_secs(10);

struct Fixture {
    scratch: tempfile::TempDir,
    bus: EventBus,
    fetcher: Arc<MockFetcher>,
    ctx: SourceContext,
}

fn fixture(fetcher: MockFetcher) -> Fixture {
    let scratch = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let fetcher = Arc::new(fetcher);
    let ctx = source_context(
        test_config(scratch.path()),
        fetcher.clone(),
        Arc::new(MockLauncher::new()),
        bus.clone(),
    );

    Fixture {
        scratch,
        bus,
        fetcher,
        ctx,
    }
}

impl Fixture {
    fn source(&self, song: Song) -> BufferedSource {
        buffered_source(song, &self.ctx, self.fetcher.clone())
    }
}

fn is_source_event(event: &Event, wanted: fn(&SourceEvent) -> bool) -> bool {
    matches!(event, Event::Source { event, .. } if wanted(event))
}

/// Receives from the raw stream until it closes, keeping only audio.
async fn collect_audio(rx: RawStream) -> Vec<u8> {
    collect(rx, WAIT)
        .await
        .iter()
        .filter(|chunk| !is_silence(chunk))
        .flat_map(|chunk| chunk.iter().copied())
        .collect()
}

/// Test buffer becomes ready once three large chunks are persisted.
#[tokio::test]
async fn test_buffer_ready_after_three_chunks() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Stall(pcm(3200))]));
    let mut subscriber = fixture.bus.subscribe();

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);

    let ready = wait_for_event(&mut subscriber, WAIT, |e| {
        is_source_event(e, |e| *e == SourceEvent::BufferReady)
    })
    .await;

    assert!(ready.is_some(), "Expected BufferReady");
    assert!(source.is_ready());
    assert_eq!(source.large_chunks(), 3);

    source.destroy().await;
}

/// Test a song shorter than the ready threshold becomes ready once complete.
#[tokio::test]
async fn test_short_song_ready_on_completion() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(pcm(300))]));
    let mut subscriber = fixture.bus.subscribe();

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);

    let ready = wait_for_event(&mut subscriber, WAIT, |e| {
        is_source_event(e, |e| *e == SourceEvent::BufferReady)
    })
    .await;

    assert!(ready.is_some());
    assert_eq!(source.large_chunks(), 1);

    source.destroy().await;
}

/// Test failed attempts before ready leave nothing behind in the store.
#[tokio::test]
async fn test_retry_before_ready_starts_clean() {
    let fetcher = MockFetcher::new().script(
        1,
        vec![
            Attempt::FailAfter(filled_pcm(500, 1)),
            Attempt::FailAfter(filled_pcm(500, 2)),
            Attempt::Refuse,
            Attempt::FailAfter(filled_pcm(500, 4)),
            Attempt::Serve(filled_pcm(3500, 5)),
        ],
    );
    let fixture = fixture(fetcher);

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);

    assert!(eventually(WAIT, || source.large_chunks() == 4).await);
    assert_eq!(fixture.fetcher.opens(), 5);

    let dir = source.scratch_dir().unwrap();
    let mut total = 0;
    for index in 0..4 {
        let data = std::fs::read(dir.join(format!("{index}.pcm"))).unwrap();
        assert!(data.iter().all(|b| *b == 5), "Chunk {index} has stale data");
        total += data.len();
    }
    assert_eq!(total, pcm_bytes_for_ms(3500));

    source.destroy().await;
}

/// Test the source gives up after five failed attempts.
#[tokio::test]
async fn test_fatal_after_max_attempts() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Refuse]));
    let mut subscriber = fixture.bus.subscribe();

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);

    let fatal = wait_for_event(&mut subscriber, WAIT, |e| {
        is_source_event(e, |e| matches!(e, SourceEvent::Fatal { .. }))
    })
    .await;

    let Some(Event::Source {
        event: SourceEvent::Fatal { diagnostic },
        playback,
    }) = fatal
    else {
        panic!("Expected Fatal event");
    };

    assert_eq!(playback, source.playback_id());
    assert!(diagnostic.contains("attempt 1:"));
    assert!(diagnostic.contains("attempt 5:"));
    assert!(diagnostic.contains("simulated connection refused"));
    assert_eq!(fixture.fetcher.opens(), 5);

    // A failed source does not restart
    source.buffer_stream(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.fetcher.opens(), 5);

    source.destroy().await;
}

/// Test an unknown song fails every attempt with the fetcher's reason.
#[tokio::test]
async fn test_fatal_diagnostic_from_fetcher() {
    let fixture = fixture(MockFetcher::new());
    let mut subscriber = fixture.bus.subscribe();

    let source = fixture.source(mock_song(99, SourceKind::CloudFile));
    source.buffer_stream(1);

    let fatal = wait_for_event(&mut subscriber, WAIT, |e| {
        is_source_event(e, |e| matches!(e, SourceEvent::Fatal { .. }))
    })
    .await;

    match fatal {
        Some(Event::Source {
            event: SourceEvent::Fatal { diagnostic },
            ..
        }) => assert!(diagnostic.contains("Unknown song 99")),
        other => panic!("Expected Fatal event, got {other:?}"),
    }

    source.destroy().await;
}

/// Test destroying a source that is still acquiring removes its directory.
#[tokio::test]
async fn test_destroy_before_ready() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Stall(pcm(500))]));
    let mut subscriber = fixture.bus.subscribe();

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);

    assert!(eventually(WAIT, || source.scratch_dir().is_some()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!source.is_ready());

    source.destroy().await;

    assert!(source.is_destroyed());
    assert!(source.scratch_dir().is_none());
    assert_eq!(dir_entries(fixture.scratch.path()), 0);

    while let Ok(event) = subscriber.try_recv() {
        assert!(
            !is_source_event(&event, |e| *e == SourceEvent::BufferReady),
            "Destroyed source must not become ready"
        );
    }
}

/// Test destroying a source mid-delivery closes the stream and cleans up.
#[tokio::test]
async fn test_destroy_during_delivery() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(pcm(2500))]));

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);
    let mut rx = source.get_stream().unwrap();

    for _ in 0..5 {
        assert!(rx.recv().await.is_some());
    }

    source.destroy().await;
    assert_eq!(dir_entries(fixture.scratch.path()), 0);

    let closed = tokio::time::timeout(WAIT, async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "Stream should close after destroy");

    // Idempotent
    source.destroy().await;
    assert!(source.is_destroyed());
}

/// Test full delivery reproduces the song and ends with Finished.
#[tokio::test]
async fn test_delivery_reproduces_song() {
    let song = pcm(230);
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(song.clone())]));
    let mut subscriber = fixture.bus.subscribe();

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);
    let rx = source.get_stream().unwrap();

    // Each message is at most one small chunk
    let chunks = collect(rx, WAIT).await;
    assert!(chunks.iter().all(|c| c.len() <= small_chunk_bytes()));

    let audio: Vec<u8> = chunks
        .iter()
        .filter(|c| !is_silence(c))
        .flat_map(|c| c.iter().copied())
        .collect();
    assert_eq!(audio, song);

    let finished = wait_for_event(&mut subscriber, WAIT, |e| {
        is_source_event(e, |e| *e == SourceEvent::Finished)
    })
    .await;
    assert!(finished.is_some());
    assert_eq!(source.played_duration(), Duration::from_millis(230));

    source.destroy().await;
    assert_eq!(dir_entries(fixture.scratch.path()), 0);
}

/// Test the raw stream can only be taken once.
#[tokio::test]
async fn test_stream_taken_once() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(pcm(100))]));

    let source = fixture.source(mock_song(1, SourceKind::Network));
    let _rx = source.get_stream().unwrap();

    assert!(source.get_stream().is_err());

    source.destroy().await;
}

/// Test delivery is paced by the chunk timing.
#[tokio::test]
async fn test_delivery_is_paced() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(pcm(300))]));

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);
    let mut rx = source.get_stream().unwrap();

    // The first chunk marks the anchor
    rx.recv().await.unwrap();
    let start = tokio::time::Instant::now();
    for _ in 0..20 {
        rx.recv().await.unwrap();
    }
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_millis(150),
        "20 ticks of 10 ms took only {elapsed:?}"
    );

    source.destroy().await;
}

/// Test pausing writes silence and resuming continues where it left off.
#[tokio::test]
async fn test_pause_resume_continuity() {
    let song = pcm(500);
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(song.clone())]));

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);
    let mut rx = source.get_stream().unwrap();

    let mut audio = vec![];
    for _ in 0..5 {
        let chunk = rx.recv().await.unwrap();
        audio.extend_from_slice(&chunk);
    }

    source.pause();
    assert!(source.is_paused());

    let mut paused_chunks = vec![];
    for _ in 0..10 {
        paused_chunks.push(rx.recv().await.unwrap());
    }

    // Chunks already in flight may still be audio, the rest must be silence
    for chunk in &paused_chunks {
        if !is_silence(chunk) {
            audio.extend_from_slice(chunk);
        }
    }
    assert!(paused_chunks[5..].iter().all(|c| is_silence(c)));
    assert!(paused_chunks
        .iter()
        .all(|c| c.len() == small_chunk_bytes()));

    let played = source.played_duration();
    source.resume();
    assert!(!source.is_paused());

    audio.extend(collect_audio(rx).await);
    assert_eq!(audio, song);
    assert!(source.played_duration() > played);

    source.destroy().await;
}

/// Test a live source joins near the live edge and drops stale chunks.
#[tokio::test]
async fn test_live_catch_up() {
    let data: Vec<u8> = (0..8u8).flat_map(|i| filled_pcm(1000, i + 1)).collect();
    let fixture = fixture(MockFetcher::new().script(7, vec![Attempt::Serve(data)]));

    let source = fixture.source(mock_live_song(7));
    source.buffer_stream(1);

    assert!(eventually(WAIT, || source.large_chunks() == 8).await);
    let dir = source.scratch_dir().unwrap();

    let mut rx = source.get_stream().unwrap();
    let first = loop {
        let chunk = rx.recv().await.unwrap();
        if !is_silence(&chunk) {
            break chunk;
        }
    };

    // Window is 5 chunks and lag is 2, so playback starts at chunk 6
    assert!(first.iter().all(|b| *b == 7), "Expected audio of chunk 6");

    assert!(
        eventually(WAIT, || (0..7).all(|i| !dir.join(format!("{i}.pcm")).exists())).await,
        "Stale chunks should be deleted"
    );

    source.destroy().await;
    assert_eq!(dir_entries(fixture.scratch.path()), 0);
}

/// Test silence written while the consumer is stalled does not delay the
/// audio after resume.
#[tokio::test]
async fn test_resume_without_silence_backlog() {
    let song = pcm(1000);
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(song.clone())]));

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);
    let mut rx = source.get_stream().unwrap();

    let mut audio = vec![];
    for _ in 0..5 {
        audio.extend_from_slice(&rx.recv().await.unwrap());
    }

    // Nobody reads for 50 ticks
    source.pause();
    tokio::time::sleep(Duration::from_millis(500)).await;
    source.resume();

    let mut silent = 0;
    for _ in 0..20 {
        let chunk = rx.recv().await.unwrap();
        if is_silence(&chunk) {
            silent += 1;
        } else {
            audio.extend_from_slice(&chunk);
        }
    }
    assert!(silent <= 5, "{silent} silent chunks queued ahead of the audio");

    audio.extend(collect_audio(rx).await);
    assert_eq!(audio, song);

    source.destroy().await;
}

/// Test a new chunk timing changes the pace of a running source without
/// restarting acquisition.
#[tokio::test]
async fn test_set_chunk_timing_changes_pace() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(pcm(1000))]));

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);
    let mut rx = source.get_stream().unwrap();

    rx.recv().await.unwrap();
    rx.recv().await.unwrap();

    source.set_chunk_timing(Duration::from_millis(20));
    assert_eq!(source.chunk_timing(), Duration::from_millis(20));

    // The tick scheduled before the change
    rx.recv().await.unwrap();
    let start = tokio::time::Instant::now();
    for _ in 0..15 {
        rx.recv().await.unwrap();
    }
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_millis(200),
        "15 ticks of 20 ms took only {elapsed:?}"
    );
    assert_eq!(fixture.fetcher.opens(), 1);

    source.destroy().await;
}

/// Test a chunk that cannot be read back fails the source instead of being
/// skipped.
#[tokio::test]
async fn test_unreadable_chunk_is_fatal() {
    let fixture = fixture(MockFetcher::new().script(1, vec![Attempt::Serve(pcm(3500))]));
    let mut subscriber = fixture.bus.subscribe();

    let source = fixture.source(mock_song(1, SourceKind::Network));
    source.buffer_stream(1);
    assert!(eventually(WAIT, || source.large_chunks() == 4).await);

    // Chunk 0 loads up front, chunk 1 is read while it plays
    let dir = source.scratch_dir().unwrap();
    for index in 1..4 {
        std::fs::remove_file(dir.join(format!("{index}.pcm"))).unwrap();
    }
    let _rx = source.get_stream().unwrap();

    let fatal = wait_for_event(&mut subscriber, WAIT, |e| {
        is_source_event(e, |e| matches!(e, SourceEvent::Fatal { .. }))
    })
    .await;

    match fatal {
        Some(Event::Source {
            event: SourceEvent::Fatal { diagnostic },
            playback,
        }) => {
            assert_eq!(playback, source.playback_id());
            assert!(
                diagnostic.contains("Failed to read chunk 1 after 5 attempts"),
                "Unexpected diagnostic {diagnostic}"
            );
        }
        other => panic!("Expected Fatal event, got {other:?}"),
    }
    assert_eq!(fixture.fetcher.opens(), 1);

    source.destroy().await;
}

/// Test live refreshes give every cycle the full attempt budget.
#[tokio::test]
async fn test_live_refresh_is_not_a_failure() {
    let cycle = [Attempt::Refuse, Attempt::Refuse, Attempt::Stall(pcm(500))];
    let script: Vec<Attempt> = cycle.iter().cycle().take(9).cloned().collect();

    let scratch = tempfile::tempdir().unwrap();
    let mut config = test_config(scratch.path());
    config.retry.live_refresh_secs = 1;
    let bus = EventBus::new();
    let fetcher = Arc::new(MockFetcher::new().script(7, script));
    let ctx = source_context(config, fetcher.clone(), Arc::new(MockLauncher::new()), bus.clone());
    let mut subscriber = bus.subscribe();

    let source = buffered_source(mock_live_song(7), &ctx, fetcher.clone());
    source.buffer_stream(1);

    // Six refusals over three refresh cycles, more than one budget allows
    assert!(eventually(WAIT, || fetcher.opens() >= 9).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    while let Ok(event) = subscriber.try_recv() {
        assert!(
            !is_source_event(&event, |e| matches!(e, SourceEvent::Fatal { .. })),
            "Refresh counted as a failed attempt: {event:?}"
        );
    }

    source.destroy().await;
}
