//! End-to-end playback tests: start directives through the coordinator,
//! decoding into the shared buffer, and render-time track changes

mod helpers;

use helpers::{control, start_wav, wait_for_event, wav_bytes, QueueFetcher, TestPlayer, ONE_SECOND_BYTES};
use slimgap_common::events::{PlayerEvent, SessionState};
use slimgap_common::protocol::{StatusCode, StrmCommand};
use std::time::Duration;

const ONE_SECOND_FRAMES: usize = 44_100;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gapless_transition_reported_at_render_time() {
    let fetcher = QueueFetcher::new([
        wav_bytes(ONE_SECOND_FRAMES, 16_384, 16_384),
        wav_bytes(ONE_SECOND_FRAMES, -8_192, -8_192),
    ]);
    let mut player = TestPlayer::start(fetcher).await;
    let mut events = player.handle.subscribe();

    // Track A decodes completely
    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;
    assert_eq!(player.buffer.write_offset(), ONE_SECOND_BYTES);
    assert!(!player.control.is_paused(), "Autoplay should have started output");

    // Track B queued behind it without a flush
    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;
    assert_eq!(player.buffer.write_offset(), 2 * ONE_SECOND_BYTES);
    assert_eq!(player.tracker.pending_offsets(), vec![ONE_SECOND_BYTES]);
    assert_eq!(player.buffer.current_read_offset(), 0);

    // Both decodes finished before anything was heard
    assert!(!player.seen().contains(&StatusCode::TrackStarted));

    let mut offsets = vec![(player.buffer.current_read_offset(), player.buffer.write_offset())];

    let first = player.render(1_000);
    assert!(first.iter().all(|s| *s == 0.5));
    player.wait_for_stat(StatusCode::TrackStarted).await;
    let track_a = match wait_for_event(&mut events, |e| matches!(e, PlayerEvent::TrackStarted { .. })).await {
        PlayerEvent::TrackStarted { track_id, .. } => track_id,
        _ => unreachable!(),
    };
    offsets.push((player.buffer.current_read_offset(), player.buffer.write_offset()));

    // Rest of A: the boundary fires when the read offset reaches it
    let rest = player.render(ONE_SECOND_FRAMES - 1_000);
    assert!(rest.iter().all(|s| *s == 0.5));
    player.wait_for_stat(StatusCode::TrackStarted).await;
    let track_b = match wait_for_event(&mut events, |e| matches!(e, PlayerEvent::TrackStarted { .. })).await {
        PlayerEvent::TrackStarted { track_id, .. } => track_id,
        _ => unreachable!(),
    };
    assert_ne!(track_a, track_b);
    assert_eq!(player.tracker.current_span().unwrap().track_id, track_b);
    assert_eq!(player.tracker.current_span().unwrap().start_offset, ONE_SECOND_BYTES);
    assert_eq!(player.handle.position(), Duration::ZERO);
    assert!(!player.tracker.has_pending());
    offsets.push((player.buffer.current_read_offset(), player.buffer.write_offset()));

    // B continues seamlessly from the same buffer
    let b = player.render(ONE_SECOND_FRAMES);
    assert_eq!(b.len(), ONE_SECOND_FRAMES * 2);
    assert!(b.iter().all(|s| *s == -0.25));
    offsets.push((player.buffer.current_read_offset(), player.buffer.write_offset()));

    // Running dry after the last decode is reported once
    assert!(player.render(100).is_empty());
    player.wait_for_stat(StatusCode::Underrun).await;

    // No further track: the heartbeat answer is "drained"
    player.send(control(StrmCommand::Status, 7)).await;
    let stat = player.wait_for_stat(StatusCode::Underrun).await;
    assert_eq!(stat.body.server_timestamp, 7);

    // Offsets only ever moved forward, read never passed write
    for pair in offsets.windows(2) {
        assert!(pair[1].0 >= pair[0].0);
        assert!(pair[1].1 >= pair[0].1);
    }
    for (read, write) in &offsets {
        assert!(read <= write);
    }

    // Decode-ready for both tracks preceded either track start
    let seen = player.seen();
    let first_start = seen.iter().position(|c| *c == StatusCode::TrackStarted).unwrap();
    let decode_ready = seen.iter().filter(|c| **c == StatusCode::DecodeReady).count();
    assert_eq!(decode_ready, 2);
    assert!(seen[..first_start].iter().filter(|c| **c == StatusCode::DecodeReady).count() == 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flush_discards_unheard_audio() {
    let fetcher = QueueFetcher::new([
        wav_bytes(ONE_SECOND_FRAMES, 16_384, 16_384),
        wav_bytes(ONE_SECOND_FRAMES, -8_192, -8_192),
    ]);
    let mut player = TestPlayer::start(fetcher).await;

    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;

    // Leave exactly 200,000 bytes unrendered
    let heard = (ONE_SECOND_BYTES - 200_000) as usize / 8;
    assert_eq!(player.render(heard).len(), heard * 2);
    assert_eq!(player.buffer.buffered(), 200_000);

    player.send(control(StrmCommand::Flush, 0)).await;
    player.wait_for_stat(StatusCode::Flushed).await;
    assert_eq!(player.buffer.write_offset(), 0);
    assert_eq!(player.buffer.current_read_offset(), 0);
    assert_eq!(player.handle.position(), Duration::ZERO);
    assert_eq!(player.handle.status().state, SessionState::AwaitingStream);

    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;

    // Everything rendered now belongs to the new track, starting at offset 0
    let next = player.render(ONE_SECOND_FRAMES + 1_000);
    assert_eq!(next.len(), ONE_SECOND_FRAMES * 2);
    assert!(next.iter().all(|s| *s == -0.25));
    assert_eq!(player.buffer.current_read_offset(), ONE_SECOND_BYTES);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paused_autostart_buffers_without_rendering() {
    let fetcher = QueueFetcher::new([wav_bytes(ONE_SECOND_FRAMES, 16_384, 16_384)]);
    let mut player = TestPlayer::start(fetcher).await;

    player.send(start_wav(b'0')).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;
    assert_eq!(player.buffer.write_offset(), ONE_SECOND_BYTES);
    assert_eq!(player.handle.status().state, SessionState::Streaming);

    assert!(player.render(1_000).is_empty());
    assert_eq!(player.buffer.current_read_offset(), 0);
    assert!(!player.seen().contains(&StatusCode::TrackStarted));

    player.send(control(StrmCommand::Unpause, 0)).await;
    player.wait_for_stat(StatusCode::Resumed).await;

    assert_eq!(player.render(1_000).len(), 2_000);
    assert_eq!(player.buffer.current_read_offset(), 8_000);
    player.wait_for_stat(StatusCode::TrackStarted).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_stops_render_and_unpause_resumes() {
    let fetcher = QueueFetcher::new([wav_bytes(ONE_SECOND_FRAMES, 16_384, 16_384)]);
    let mut player = TestPlayer::start(fetcher).await;

    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;
    player.render(1_000);
    player.wait_for_stat(StatusCode::TrackStarted).await;

    player.send(control(StrmCommand::Pause, 0)).await;
    player.wait_for_stat(StatusCode::Paused).await;
    assert_eq!(player.handle.status().state, SessionState::Paused);
    let read_offset = player.buffer.current_read_offset();
    assert!(player.render(1_000).is_empty());
    assert_eq!(player.buffer.current_read_offset(), read_offset);

    player.send(control(StrmCommand::Unpause, 0)).await;
    player.wait_for_stat(StatusCode::Resumed).await;
    assert_eq!(player.handle.status().state, SessionState::Streaming);
    assert_eq!(player.render(1_000).len(), 2_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undecodable_stream_reports_failure_and_goes_idle() {
    let fetcher = QueueFetcher::new([bytes::Bytes::from_static(b"this is not audio at all")]);
    let mut player = TestPlayer::start(fetcher).await;
    let mut events = player.handle.subscribe();

    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::NotSupported).await;

    wait_for_event(&mut events, |e| matches!(e, PlayerEvent::DecodeFailed { .. })).await;
    wait_for_event(&mut events, |e| {
        matches!(e, PlayerEvent::StateChanged { new_state: SessionState::Idle, .. })
    })
    .await;
    assert!(!player.seen().contains(&StatusCode::DecodeReady));

    // A fresh directive is accepted afterwards
    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::NotSupported).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_skip_ahead_moves_read_offset_forward() {
    let fetcher = QueueFetcher::new([wav_bytes(ONE_SECOND_FRAMES, 16_384, 16_384)]);
    let mut player = TestPlayer::start(fetcher).await;

    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;

    // 500ms forward, applied at the next render
    player.send(control(StrmCommand::SkipAhead, 500)).await;
    player.send(control(StrmCommand::Status, 1)).await;
    player.wait_for_stat(StatusCode::Timer).await;

    assert_eq!(player.render(100).len(), 200);
    assert_eq!(
        player.buffer.current_read_offset(),
        ONE_SECOND_BYTES / 2 + 800
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_continue_start_keeps_predecessor_decode_ready() {
    let fetcher = QueueFetcher::new([
        wav_bytes(2 * ONE_SECOND_FRAMES, 16_384, 16_384),
        wav_bytes(ONE_SECOND_FRAMES, -8_192, -8_192),
    ]);
    let mut player = TestPlayer::start(fetcher).await;

    // Heartbeats queue up while A decodes, so A can finish and exit before
    // its completion is handled
    player.send(start_wav(b'1')).await;
    for timestamp in 0..6_000 {
        player.send(control(StrmCommand::Status, timestamp)).await;
    }
    player.send(start_wav(b'3')).await;

    player.wait_for_stat(StatusCode::DecodeReady).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;
    assert_eq!(player.buffer.write_offset(), 3 * ONE_SECOND_BYTES);
    assert_eq!(player.tracker.pending_offsets(), vec![2 * ONE_SECOND_BYTES]);

    let all = player.render(3 * ONE_SECOND_FRAMES);
    assert_eq!(all.len(), 3 * ONE_SECOND_FRAMES * 2);
    assert!(all[..4 * ONE_SECOND_FRAMES].iter().all(|s| *s == 0.5));
    assert!(all[4 * ONE_SECOND_FRAMES..].iter().all(|s| *s == -0.25));
    player.wait_for_stat(StatusCode::TrackStarted).await;
    player.wait_for_stat(StatusCode::TrackStarted).await;

    assert!(player.render(100).is_empty());
    player.wait_for_stat(StatusCode::Underrun).await;

    let decode_ready = player
        .seen()
        .iter()
        .filter(|c| **c == StatusCode::DecodeReady)
        .count();
    assert_eq!(decode_ready, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_during_decode_replaces_current_track() {
    // Long enough to stall on backpressure with nothing rendering
    let fetcher = QueueFetcher::new([
        wav_bytes(12 * ONE_SECOND_FRAMES, 16_384, 16_384),
        wav_bytes(ONE_SECOND_FRAMES, -8_192, -8_192),
    ]);
    let mut player = TestPlayer::start(fetcher).await;
    let mut events = player.handle.subscribe();

    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::Connected).await;

    // Not a Continue start, and A is still decoding: hard replace
    player.send(start_wav(b'1')).await;
    player.wait_for_stat(StatusCode::DecodeReady).await;
    assert_eq!(player.buffer.write_offset(), ONE_SECOND_BYTES);
    assert!(!player.tracker.has_pending());
    let span = player.tracker.current_span().unwrap();
    assert_eq!(span.start_offset, 0);

    let samples = player.render(1_000);
    assert!(samples.iter().all(|s| *s == -0.25));
    player.wait_for_stat(StatusCode::TrackStarted).await;
    match wait_for_event(&mut events, |e| matches!(e, PlayerEvent::TrackStarted { .. })).await {
        PlayerEvent::TrackStarted { track_id, .. } => assert_eq!(track_id, span.track_id),
        _ => unreachable!(),
    }

    player.render(ONE_SECOND_FRAMES);
    player.wait_for_stat(StatusCode::Underrun).await;

    // The replaced track never reported decode-ready or started
    let seen = player.seen();
    assert_eq!(seen.iter().filter(|c| **c == StatusCode::DecodeReady).count(), 1);
    assert_eq!(seen.iter().filter(|c| **c == StatusCode::TrackStarted).count(), 1);
}
