//! Роль streamer против поддельного транспорта и записывающего сигнального канала.

mod harness;

use harness::*;
use ssc_stream::media::{Constraints, MediaError};
use ssc_stream::peer::{ConnectivityState, IceCandidate, SessionDescription};
use ssc_stream::{spawn, Phase, SessionEvent, SessionHandle, SessionTag, Signal, Streamer};
use std::sync::Arc;
use std::time::Duration;

fn start(acquirer: Arc<FakeAcquirer>, transport: Arc<FakeTransport>, sink: Arc<RecordingSink>) -> SessionHandle {
    init_tracing();
    spawn(
        Arc::new(Streamer::new(
            acquirer,
            Constraints::rear_camera(),
            Constraints::any_camera(),
        )),
        transport,
        sink,
    )
}

fn offer_tag(sink: &RecordingSink, n: usize) -> SessionTag {
    sink.nth("offer", n).expect("offer was sent").tag().clone()
}

fn remote_candidate(name: &str) -> IceCandidate {
    IceCandidate::new(format!("candidate:1 1 udp 2122260223 192.168.1.2 40000 typ host {name}"))
}

#[tokio::test]
async fn test_offer_is_sent_on_start() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());

    eventually("offer sent", || sink.count("offer") == 1).await;
    eventually("local candidates sent", || {
        sink.count("streamer-ice-candidate") == CANDIDATES_PER_PEER
    })
    .await;

    let tag = offer_tag(&sink, 0);
    assert_eq!(tag.epoch, 1);
    assert!(sink
        .signals()
        .iter()
        .all(|s| s.tag() == &tag));
    match sink.nth("offer", 0) {
        Some(Signal::Offer { description, .. }) => {
            assert_eq!(description, SessionDescription::offer("s1-offer"))
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(streamer.status().phase, Phase::Negotiating);
    assert!(!streamer.status().waiting);
    assert_eq!(entries(&log), vec!["acquire:1", "create:s1"]);
}

#[tokio::test]
async fn test_reset_twice_equals_reset_once() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let acquirer = FakeAcquirer::new(log.clone(), vec![]);
    let streamer = start(acquirer.clone(), transport.clone(), sink.clone());
    eventually("first offer", || sink.count("offer") == 1).await;

    streamer.reset().unwrap();
    streamer.reset().unwrap();

    eventually("second offer", || sink.count("offer") == 2).await;
    settle().await;
    assert_eq!(sink.count("offer"), 2);
    assert_eq!(transport.count(), 2);
    assert_eq!(acquirer.calls(), 2);
    assert_eq!(streamer.status().epoch, 2);
    assert_eq!(offer_tag(&sink, 1).epoch, 2);
    assert!(transport.peer(0).unwrap().is_closed());
    assert!(!transport.peer(1).unwrap().is_closed());
}

#[tokio::test]
async fn test_transient_and_closed_states_do_not_reset() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let acquirer = FakeAcquirer::new(log.clone(), vec![]);
    let streamer = start(acquirer.clone(), transport.clone(), sink.clone());
    eventually("first offer", || sink.count("offer") == 1).await;

    let first = transport.peer(0).unwrap();
    first.emit_state(ConnectivityState::Connecting);
    first.emit_state(ConnectivityState::Closed);
    settle().await;
    assert_eq!(transport.count(), 1);
    assert_eq!(acquirer.calls(), 1);
    assert_eq!(streamer.status().epoch, 1);
    assert_eq!(streamer.status().connectivity, Some(ConnectivityState::Closed));

    first.emit_state(ConnectivityState::Failed);
    eventually("new offer after failure", || sink.count("offer") == 2).await;
    assert_eq!(streamer.status().epoch, 2);
    assert!(first.is_closed());
    assert!(position(&log, "stop:media-1") < position(&log, "acquire:2"));
}

#[tokio::test]
async fn test_offer_finished_after_reset_is_not_sent() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    transport.delay_next_offer(Duration::from_millis(200));
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());

    eventually("first connection", || transport.count() == 1).await;
    settle().await;
    assert_eq!(sink.count("offer"), 0, "first offer is still being created");
    streamer.reset().unwrap();

    eventually("offer for the new epoch", || sink.count("offer") == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.count("offer"), 1);
    assert_eq!(offer_tag(&sink, 0).epoch, 2);
    let first = transport.peer(0).unwrap();
    assert!(first.is_closed());
    assert_eq!(first.local(), None);
    assert!(sink.signals().iter().all(|s| s.tag().epoch == 2));
}

#[tokio::test]
async fn test_events_from_closed_connection_are_ignored() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());
    eventually("first offer", || sink.count("offer") == 1).await;

    streamer.reset().unwrap();
    eventually("second offer", || sink.count("offer") == 2).await;

    // прежнее соединение ещё шлёт события после закрытия
    transport.peer(0).unwrap().emit_state(ConnectivityState::Failed);
    settle().await;
    assert_eq!(transport.count(), 2);
    assert_eq!(streamer.status().epoch, 2);
}

#[tokio::test]
async fn test_fallback_once_then_halt() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let acquirer = FakeAcquirer::new(
        log.clone(),
        vec![
            MediaError::Overconstrained("facingMode".into()),
            MediaError::Other("device busy".into()),
        ],
    );
    let streamer = start(acquirer.clone(), transport.clone(), sink.clone());
    let mut events = streamer.subscribe();

    wait_phase(&streamer, Phase::Halted).await;
    settle().await;
    assert_eq!(acquirer.calls(), 2, "no retry loop after the fallback fails");
    assert_eq!(transport.count(), 0);
    assert_eq!(sink.count("offer"), 0);

    let mut halted = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Halted { message, .. } = event {
            halted = Some(message);
        }
    }
    assert!(halted.unwrap().contains("device busy"));

    // без соединения сброс ничего не делает
    streamer.reset().unwrap();
    settle().await;
    assert_eq!(acquirer.calls(), 2);
    assert_eq!(streamer.status().phase, Phase::Halted);

    streamer.restart().unwrap();
    eventually("offer after restart", || sink.count("offer") == 1).await;
    assert_eq!(acquirer.calls(), 3);
    assert_eq!(offer_tag(&sink, 0).epoch, 1);
}

#[tokio::test]
async fn test_missing_rear_camera_falls_back() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let acquirer = FakeAcquirer::new(log.clone(), vec![MediaError::NotFound]);
    let _streamer = start(acquirer.clone(), transport.clone(), sink.clone());

    eventually("offer", || sink.count("offer") == 1).await;
    assert_eq!(acquirer.calls(), 2);
    assert_eq!(entries(&log), vec!["acquire:1", "acquire:2", "create:s1"]);
}

#[tokio::test]
async fn test_connection_creation_failure_releases_media() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    transport.fail_next();
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());

    wait_phase(&streamer, Phase::Halted).await;
    assert!(entries(&log).contains(&"stop:media-1".to_string()));

    streamer.restart().unwrap();
    eventually("offer after restart", || sink.count("offer") == 1).await;
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn test_stale_answer_is_discarded() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());
    eventually("first offer", || sink.count("offer") == 1).await;
    streamer.reset().unwrap();
    eventually("second offer", || sink.count("offer") == 2).await;

    let stale = offer_tag(&sink, 0);
    let current = offer_tag(&sink, 1);
    streamer
        .deliver(Signal::answer(stale, SessionDescription::answer("stale")))
        .unwrap();
    streamer
        .deliver(Signal::answer(current.clone(), SessionDescription::answer("fresh")))
        .unwrap();
    // лишний answer той же эпохи не применяется повторно
    streamer
        .deliver(Signal::answer(current, SessionDescription::answer("again")))
        .unwrap();

    let second = transport.peer(1).unwrap();
    eventually("fresh answer applied", || second.remote().is_some()).await;
    settle().await;
    assert_eq!(second.remote(), Some(SessionDescription::answer("fresh")));
    assert_eq!(transport.peer(0).unwrap().remote(), None);
}

/// Кандидаты viewer вокруг answer в заданном порядке; возвращает применённые
async fn candidates_with_answer(candidates_first: bool) -> Vec<String> {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());
    eventually("offer", || sink.count("offer") == 1).await;
    let tag = offer_tag(&sink, 0);
    let peer = transport.peer(0).unwrap();

    let answer = Signal::answer(tag.clone(), SessionDescription::answer("v-answer"));
    let trickle: Vec<Signal> = ["a", "b"]
        .into_iter()
        .map(|n| Signal::receiver_candidate(tag.clone(), remote_candidate(n)))
        .collect();

    if candidates_first {
        for signal in trickle {
            streamer.deliver(signal).unwrap();
        }
        streamer.deliver(answer).unwrap();
    } else {
        streamer.deliver(answer).unwrap();
        eventually("answer applied", || peer.remote().is_some()).await;
        for signal in trickle {
            streamer.deliver(signal).unwrap();
        }
    }

    eventually("candidates applied", || peer.candidates().len() == 2).await;
    peer.emit_state(ConnectivityState::Connected);
    wait_phase(&streamer, Phase::Connected).await;

    let mut applied = peer.candidates();
    applied.sort();
    applied
}

#[tokio::test]
async fn test_candidate_order_relative_to_answer_does_not_matter() {
    let early = candidates_with_answer(true).await;
    let late = candidates_with_answer(false).await;
    assert_eq!(early, late);
    assert_eq!(early.len(), 2);
}

#[tokio::test]
async fn test_duplicate_candidate_applied_once() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());
    eventually("offer", || sink.count("offer") == 1).await;
    let tag = offer_tag(&sink, 0);
    let peer = transport.peer(0).unwrap();

    streamer
        .deliver(Signal::answer(tag.clone(), SessionDescription::answer("v-answer")))
        .unwrap();
    for name in ["a", "a", "b"] {
        streamer
            .deliver(Signal::receiver_candidate(tag.clone(), remote_candidate(name)))
            .unwrap();
    }

    eventually("last candidate applied", || {
        peer.candidates().iter().any(|c| c.ends_with(" b"))
    })
    .await;
    assert_eq!(peer.candidates().len(), 2);
}

#[tokio::test]
async fn test_candidate_from_another_session_is_discarded() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());
    eventually("offer", || sink.count("offer") == 1).await;
    let tag = offer_tag(&sink, 0);
    let peer = transport.peer(0).unwrap();

    streamer
        .deliver(Signal::answer(tag.clone(), SessionDescription::answer("v-answer")))
        .unwrap();
    let foreign = SessionTag {
        session: "someone-else".into(),
        epoch: tag.epoch,
    };
    streamer
        .deliver(Signal::receiver_candidate(foreign, remote_candidate("foreign")))
        .unwrap();
    streamer
        .deliver(Signal::receiver_candidate(tag, remote_candidate("own")))
        .unwrap();

    eventually("own candidate applied", || {
        peer.candidates().iter().any(|c| c.ends_with("own"))
    })
    .await;
    assert_eq!(peer.candidates().len(), 1);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let streamer = start(FakeAcquirer::new(log.clone(), vec![]), transport.clone(), sink.clone());
    eventually("offer", || sink.count("offer") == 1).await;

    streamer.shutdown().await.unwrap();
    assert_eq!(streamer.status().phase, Phase::Stopped);
    assert!(transport.peer(0).unwrap().is_closed());
    assert!(entries(&log).contains(&"stop:media-1".to_string()));
    assert!(streamer.reset().is_err());
}

#[tokio::test]
async fn test_shutdown_during_acquisition_releases_media() {
    let log = journal();
    let transport = FakeTransport::new("s", log.clone());
    let sink = RecordingSink::new();
    let acquirer = FakeAcquirer::delayed(log.clone(), Duration::from_millis(200));
    let streamer = start(acquirer.clone(), transport.clone(), sink.clone());
    eventually("acquisition started", || acquirer.calls() == 1).await;

    streamer.shutdown().await.unwrap();
    assert_eq!(streamer.status().phase, Phase::Stopped);
    assert!(entries(&log).contains(&"stop:media-1".to_string()));
    settle().await;
    assert_eq!(transport.count(), 0);
    assert_eq!(sink.count("offer"), 0);
}
