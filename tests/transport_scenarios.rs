//! 端到端场景：环形缓冲区、节拍、会话状态机与模拟 transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use roger_transport::audio::format::{BitOrder, SourceFormat};
use roger_transport::audio::{FrameCadence, RingBuffer};
use roger_transport::decode::{SampleSource, SourceBlock, ToneSource};
use roger_transport::session::{ReopenStrategy, SessionState};
use roger_transport::transport::{Clocking, Pace, SimEvent, SimHandle, SimulatedTransport};
use roger_transport::{CapabilitySet, ProducerHandle, SessionConfig, SessionError, TransportError, TransportSession};

type Session = TransportSession<SimulatedTransport>;

fn session_with(caps: CapabilitySet, clocking: Clocking) -> (Session, ProducerHandle, SimHandle) {
    let sim = SimulatedTransport::new(caps, 64, clocking);
    let handle = sim.handle();
    let mut session = TransportSession::new(sim, SessionConfig::fast());
    let producer = session.take_producer().unwrap();
    (session, producer, handle)
}

fn manual() -> (Session, ProducerHandle, SimHandle) {
    session_with(CapabilitySet::full(), Clocking::Manual)
}

fn threaded() -> (Session, ProducerHandle, SimHandle) {
    session_with(
        CapabilitySet::full(),
        Clocking::Threaded {
            pace: Pace::Fixed(Duration::from_millis(1)),
            realtime_priority: false,
        },
    )
}

fn tone_block(format: SourceFormat, frames: u64) -> SourceBlock {
    ToneSource::new(format, 1_000.0, frames)
        .block_frames(frames as usize)
        .next_block()
        .unwrap()
        .unwrap()
}

fn longest_run(data: &[u8], byte: u8) -> usize {
    let mut best = 0;
    let mut run = 0;
    for &b in data {
        run = if b == byte { run + 1 } else { 0 };
        best = best.max(run);
    }
    best
}

#[test]
fn ring_preserves_fifo_order_across_threads() {
    const TOTAL: usize = 1 << 20;
    let ring = Arc::new(RingBuffer::with_min_capacity(1_000));
    assert_eq!(ring.capacity(), 1_024);

    let producer_ring = Arc::clone(&ring);
    let producer = thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(1);
        let mut next = 0usize;
        while next < TOTAL {
            let n = rng.gen_range(1..=700).min(TOTAL - next);
            let chunk: Vec<u8> = (next..next + n).map(|i| (i % 251) as u8).collect();
            let written = producer_ring.push(&chunk);
            next += written;
            if written == 0 {
                thread::yield_now();
            }
        }
    });

    let mut rng = StdRng::seed_from_u64(2);
    let mut buf = vec![0u8; 700];
    let mut expected = 0usize;
    while expected < TOTAL {
        let n = rng.gen_range(1..=700);
        let filled = ring.pop(&mut buf[..n]).filled(n);
        for &b in &buf[..filled] {
            assert_eq!(b, (expected % 251) as u8, "byte {} out of order", expected);
            expected += 1;
        }
        if filled == 0 {
            thread::yield_now();
        }
    }
    producer.join().unwrap();
    assert_eq!(ring.available(), 0);
}

#[test]
fn cadence_windows_sum_exactly_at_44k1() {
    let mut cadence = FrameCadence::new(44_100, 1_000);
    let frames: Vec<u32> = (0..10_000).map(|_| cadence.next_frames()).collect();
    assert!(frames.windows(10).all(|w| w.iter().sum::<u32>() == 441));
    assert!(frames.iter().all(|&f| f == 44 || f == 45));
}

#[test]
fn dsd_family_change_runs_full_reopen_with_scaled_flush() {
    let (mut session, mut producer, handle) = threaded();
    let diag = session.diagnostics_handle();
    handle.set_release_probe(move || diag.in_flight());
    handle.enable_capture(1 << 22);

    let dsd128 = SourceFormat::dsd(5_644_800, 2, BitOrder::MsbFirst);
    let dsd64_48k = SourceFormat::dsd(3_072_000, 2, BitOrder::MsbFirst);
    session.open(dsd128).unwrap();

    // 10ms 的 DSD128 数据
    let block = tone_block(dsd128, 1_764);
    assert_eq!(producer.send_audio(&block.data, block.sample_count()).unwrap(), 14_112);

    let strategy = session.change_format(&mut producer, dsd64_48k).unwrap();
    assert_eq!(strategy, ReopenStrategy::FullReopen);
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.source_format(), Some(dsd64_48k));

    let flush = session.last_flush().unwrap();
    assert_eq!(flush.multiplier, 2);
    assert_eq!(flush.silence, Duration::from_millis(40));
    // 1 411 200 B/s × 40ms
    assert_eq!(flush.bytes, 56_448);
    assert_eq!(flush.settle, Duration::from_millis(10));
    assert_eq!(session.counters().full_reopens, 1);

    let events = handle.events();
    let stopped = events.iter().position(|e| *e == SimEvent::Stopped).unwrap();
    let released = events
        .iter()
        .position(|e| matches!(e, SimEvent::Released { .. }))
        .unwrap();
    let reconnected = events
        .iter()
        .rposition(|e| matches!(e, SimEvent::Connected(_)))
        .unwrap();
    assert!(stopped < released && released < reconnected);
    assert_eq!(
        events[released],
        SimEvent::Released {
            in_flight: 0,
            streaming: false
        }
    );
    assert!(matches!(events[reconnected], SimEvent::Connected(w) if w.sample_rate == 3_072_000));

    session.close().unwrap();
    let capture = handle.take_capture();
    assert!(longest_run(&capture, 0x69) >= 56_448);
}

#[test]
fn same_class_change_renegotiates_without_release() {
    let (mut session, mut producer, handle) = manual();
    session.open(SourceFormat::pcm(44_100, 2, 16)).unwrap();
    assert_eq!(session.diagnostics().ring_capacity, 32_768);

    let hires = SourceFormat::pcm(88_200, 2, 16);
    let strategy = session.change_format(&mut producer, hires).unwrap();
    assert_eq!(strategy, ReopenStrategy::LightReopen);
    assert_eq!(session.counters().light_reopens, 1);
    assert_eq!(session.diagnostics().ring_capacity, 65_536);
    assert_eq!(session.wire_format().map(|w| w.sample_rate), Some(88_200));

    let events = handle.events();
    assert!(events.iter().any(|e| matches!(e, SimEvent::Renegotiated(_))));
    assert!(!events.iter().any(|e| matches!(e, SimEvent::Released { .. })));
    assert!(handle.is_streaming());
}

#[test]
fn light_reopen_plays_out_accepted_audio_first() {
    let (mut session, mut producer, handle) = threaded();
    session.open(SourceFormat::pcm(44_100, 2, 16)).unwrap();

    // 100ms，整块放得进 32 KiB 的环
    let block = tone_block(SourceFormat::pcm(44_100, 2, 16), 4_410);
    assert_eq!(producer.send_audio(&block.data, block.sample_count()).unwrap(), 17_640);
    handle.clear_events();

    let strategy = session
        .change_format(&mut producer, SourceFormat::pcm(88_200, 2, 16))
        .unwrap();
    assert_eq!(strategy, ReopenStrategy::LightReopen);

    let diag = session.diagnostics();
    assert_eq!(diag.bytes_played, 17_640);
    assert_eq!(diag.ring_available, Some(0));
    assert_eq!(diag.drain_timeouts, 0);

    let events = handle.events();
    assert!(events.iter().any(|e| matches!(e, SimEvent::Renegotiated(w) if w.sample_rate == 88_200)));
    assert!(!events.contains(&SimEvent::Stopped));
    assert!(!events.iter().any(|e| matches!(e, SimEvent::Released { .. })));

    session.close().unwrap();
}

#[test]
fn identical_format_quick_resume_clears_ring() {
    let (mut session, mut producer, handle) = manual();
    let format = SourceFormat::pcm(48_000, 2, 16);
    session.open(format).unwrap();

    let block = tone_block(format, 480);
    producer.send_audio(&block.data, block.sample_count()).unwrap();
    assert_eq!(session.diagnostics().ring_available, Some(1_920));

    let strategy = session.change_format(&mut producer, format).unwrap();
    assert_eq!(strategy, ReopenStrategy::QuickResume);
    // 缓冲的数据被丢弃，而不是播出
    let diag = session.diagnostics();
    assert_eq!(diag.ring_available, Some(0));
    assert_eq!(diag.bytes_played, 0);
    assert_eq!(session.counters().quick_resumes, 1);
    assert_eq!(handle.events().iter().filter(|e| **e == SimEvent::Started).count(), 1);

    handle.enable_capture(1 << 12);
    handle.pump(4);
    assert!(handle.take_capture().iter().all(|&b| b == 0));
}

#[test]
fn backpressure_wakes_producer_through_session() {
    let sim = SimulatedTransport::new(
        CapabilitySet::full(),
        64,
        Clocking::Threaded {
            pace: Pace::Fixed(Duration::from_millis(1)),
            realtime_priority: false,
        },
    );
    let handle = sim.handle();
    let config = SessionConfig {
        backpressure_timeout: Duration::from_millis(500),
        ..SessionConfig::fast()
    };
    let mut session = TransportSession::new(sim, config);
    let mut producer = session.take_producer().unwrap();
    handle.enable_capture(1 << 20);

    let format = SourceFormat::pcm(48_000, 2, 16);
    session.open(format).unwrap();
    assert_eq!(session.diagnostics().ring_capacity, 32_768);

    // 大于环容量：只有消费者腾出空间并唤醒生产者才能送完
    let block: Vec<u8> = (0..48_000usize).map(|i| (i % 251 + 1) as u8).collect();
    assert_eq!(producer.send_audio(&block, block.len() / 2).unwrap(), 48_000);
    assert!(producer.wait_drained(Duration::from_secs(1)));
    session.close().unwrap();

    let capture = handle.take_capture();
    let start = capture.iter().position(|&b| b != 0).unwrap();
    assert!(capture.len() >= start + block.len());
    assert_eq!(&capture[start..start + block.len()], &block[..]);
}

#[test]
fn underruns_fill_silence_and_count() {
    let (mut session, mut producer, handle) = manual();
    let format = SourceFormat::pcm(48_000, 2, 16);
    session.open(format).unwrap();

    // 60ms，超过 50ms 预填充
    let block = tone_block(format, 2_880);
    assert_eq!(producer.send_audio(&block.data, block.sample_count()).unwrap(), 11_520);
    thread::sleep(Duration::from_millis(20));

    handle.enable_capture(1 << 16);
    // 每周期 256 字节：45 个完整周期后欠载
    assert_eq!(handle.pump(50), 50);

    let diag = session.diagnostics();
    assert_eq!(diag.gated_cycles, 0);
    assert_eq!(diag.underruns, 5);
    assert_eq!(diag.bytes_played, 11_520);

    let capture = handle.take_capture();
    assert_eq!(capture.len(), 50 * 256);
    assert_eq!(&capture[..11_520], &block.data[..]);
    assert!(capture[11_520..].iter().all(|&b| b == 0));
}

#[test]
fn busy_transport_is_retried_on_open() {
    let (mut session, _producer, handle) = manual();
    handle.fail_next_connects(2, TransportError::Busy);
    session.open(SourceFormat::pcm(44_100, 2, 16)).unwrap();

    assert_eq!(session.diagnostics().retries, 2);
    let failures = handle
        .events()
        .iter()
        .filter(|e| **e == SimEvent::ConnectFailed(TransportError::Busy))
        .count();
    assert_eq!(failures, 2);
}

#[test]
fn capability_mismatch_keeps_current_stream() {
    let (mut session, mut producer, handle) = manual();
    handle.set_capabilities(CapabilitySet {
        dsd_formats: 0,
        ..CapabilitySet::full()
    });
    let dsd = SourceFormat::dsd(2_822_400, 2, BitOrder::LsbFirst);

    assert!(matches!(session.open(dsd), Err(SessionError::CapabilityMismatch { .. })));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!handle.is_connected());

    let pcm = SourceFormat::pcm(44_100, 2, 16);
    session.open(pcm).unwrap();
    assert!(matches!(
        session.change_format(&mut producer, dsd),
        Err(SessionError::CapabilityMismatch { .. })
    ));
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.source_format(), Some(pcm));
    assert!(!handle.events().contains(&SimEvent::Stopped));
}

#[test]
fn rejected_renegotiation_escalates_to_full_reopen() {
    let (mut session, mut producer, handle) = threaded();
    session.open(SourceFormat::pcm(44_100, 2, 16)).unwrap();
    handle.fail_next_renegotiations(1, TransportError::Rejected("clock locked".into()));

    let strategy = session
        .change_format(&mut producer, SourceFormat::pcm(88_200, 2, 16))
        .unwrap();
    assert_eq!(strategy, ReopenStrategy::FullReopen);

    let counters = session.counters();
    assert_eq!(counters.escalations, 1);
    assert_eq!(counters.full_reopens, 1);
    assert_eq!(counters.light_reopens, 0);
    assert!(handle
        .events()
        .iter()
        .any(|e| matches!(e, SimEvent::RenegotiateFailed(_))));
    assert!(handle.is_streaming());
}

#[test]
fn close_joins_producer_before_release() {
    let (mut session, mut producer, handle) = threaded();
    let format = SourceFormat::pcm(48_000, 2, 16);
    session.open(format).unwrap();

    let exited = Arc::new(AtomicBool::new(false));
    let worker_exited = Arc::clone(&exited);
    let worker = thread::spawn(move || {
        let block = tone_block(format, 480);
        while !producer.is_cancelled() {
            if producer.send_audio(&block.data, block.sample_count()).is_err() {
                break;
            }
        }
        worker_exited.store(true, Ordering::SeqCst);
    });
    session.attach_worker(worker);
    thread::sleep(Duration::from_millis(30));

    session.close().unwrap();
    assert!(exited.load(Ordering::SeqCst));
    assert_eq!(session.state(), SessionState::Closed);

    let events = handle.events();
    let stopped = events.iter().position(|e| *e == SimEvent::Stopped).unwrap();
    let released = events
        .iter()
        .position(|e| matches!(e, SimEvent::Released { .. }))
        .unwrap();
    assert!(stopped < released);
    assert!(!handle.is_connected());
}
