//! Общие подделки для интеграционных тестов: транспорт без сети, управляемый
//! захват медиа, записывающий сигнальный канал.

#![allow(dead_code)]

use async_trait::async_trait;
use ssc_stream::media::{Constraints, LocalMedia, MediaAcquirer, MediaError, MediaTrack};
use ssc_stream::peer::{
    ConnectivityState, IceCandidate, PeerHandle, SdpKind, SessionDescription, Transport,
    TransportEvent, TransportEvents,
};
use ssc_stream::{Error, Phase, Result, SessionHandle, Signal, SignalSink};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Сколько локальных кандидатов выдаёт каждое поддельное соединение
pub const CANDIDATES_PER_PEER: usize = 2;

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// Позиция записи в журнале; паника если записи нет
pub fn position(journal: &Journal, entry: &str) -> usize {
    entries(journal)
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("journal has no {entry:?}: {:?}", entries(journal)))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug,webrtc=info")
        .with_test_writer()
        .try_init();
}

/// ========== TRANSPORT ==========

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    tracks: usize,
    closed: bool,
}

pub struct FakePeer {
    label: String,
    events: TransportEvents,
    journal: Journal,
    state: Mutex<PeerState>,
    /// Задержка create_offer этого соединения
    offer_delay: Option<Duration>,
}

impl FakePeer {
    pub fn name(&self) -> &str {
        &self.label
    }

    pub fn epoch(&self) -> u64 {
        self.events.epoch()
    }

    pub fn emit_state(&self, state: ConnectivityState) -> bool {
        self.events.emit(TransportEvent::StateChanged(state))
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.candidates.iter().map(|c| c.candidate.clone()).collect()
    }

    pub fn tracks(&self) -> usize {
        self.state.lock().unwrap().tracks
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().unwrap().closed {
            return Err(Error::Negotiation(format!("{} is closed", self.label)));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerHandle for FakePeer {
    async fn add_track(&self, _track: &MediaTrack) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().unwrap().tracks += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if let Some(delay) = self.offer_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(SessionDescription::offer(format!("{}-offer", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        match &self.state.lock().unwrap().remote {
            Some(d) if d.kind == SdpKind::Offer => {
                Ok(SessionDescription::answer(format!("{}-answer", self.label)))
            }
            _ => Err(Error::Negotiation("no remote offer".into())),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().unwrap().local = Some(description);
        for n in 0..CANDIDATES_PER_PEER {
            self.events.emit(TransportEvent::CandidateGenerated(IceCandidate::new(
                format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host {}", self.label),
            )));
        }
        self.events.emit(TransportEvent::GatheringComplete);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        if state.remote.is_some() {
            return Err(Error::Negotiation("remote description already set".into()));
        }
        state.remote = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(Error::Negotiation("candidate before remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            self.journal.lock().unwrap().push(format!("close:{}", self.label));
        }
        Ok(())
    }
}

pub struct FakeTransport {
    prefix: &'static str,
    journal: Journal,
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail_next: AtomicBool,
    create_delays: Mutex<VecDeque<Duration>>,
    offer_delays: Mutex<VecDeque<Duration>>,
}

impl FakeTransport {
    pub fn new(prefix: &'static str, journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            journal,
            peers: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            create_delays: Mutex::new(VecDeque::new()),
            offer_delays: Mutex::new(VecDeque::new()),
        })
    }

    /// Очередной `create` завершится только через `delay`
    pub fn delay_next_create(&self, delay: Duration) {
        self.create_delays.lock().unwrap().push_back(delay);
    }

    /// Следующее созданное соединение задержит свой create_offer
    pub fn delay_next_offer(&self, delay: Duration) {
        self.offer_delays.lock().unwrap().push_back(delay);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Option<Arc<FakePeer>> {
        self.peers.lock().unwrap().get(index).cloned()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerHandle>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Negotiation("transport unavailable".into()));
        }
        let delay = self.create_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let offer_delay = self.offer_delays.lock().unwrap().pop_front();
        let mut peers = self.peers.lock().unwrap();
        let label = format!("{}{}", self.prefix, peers.len() + 1);
        self.journal.lock().unwrap().push(format!("create:{label}"));
        let peer = Arc::new(FakePeer {
            label,
            events,
            journal: self.journal.clone(),
            state: Mutex::new(PeerState::default()),
            offer_delay,
        });
        peers.push(peer.clone());
        Ok(peer)
    }
}

/// ========== MEDIA ==========

pub struct FakeMedia {
    id: String,
    journal: Journal,
    stopped: AtomicBool,
}

impl LocalMedia for FakeMedia {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<MediaTrack> {
        Vec::new()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.journal.lock().unwrap().push(format!("stop:{}", self.id));
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Захват по сценарию: очередные ошибки из очереди, затем успех
pub struct FakeAcquirer {
    journal: Journal,
    calls: AtomicUsize,
    failures: Mutex<VecDeque<MediaError>>,
    delay: Option<Duration>,
}

impl FakeAcquirer {
    pub fn new(journal: Journal, failures: Vec<MediaError>) -> Arc<Self> {
        Arc::new(Self {
            journal,
            calls: AtomicUsize::new(0),
            failures: Mutex::new(failures.into()),
            delay: None,
        })
    }

    /// Каждый захват занимает `delay`
    pub fn delayed(journal: Journal, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            journal,
            calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaAcquirer for FakeAcquirer {
    async fn acquire(
        &self,
        _constraints: &Constraints,
    ) -> std::result::Result<Arc<dyn LocalMedia>, MediaError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.lock().unwrap().push(format!("acquire:{n}"));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(Arc::new(FakeMedia {
            id: format!("media-{n}"),
            journal: self.journal.clone(),
            stopped: AtomicBool::new(false),
        }))
    }
}

/// ========== SIGNALING ==========

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Signal>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.signals().iter().filter(|s| s.event() == event).count()
    }

    /// n-й отправленный сигнал данного типа
    pub fn nth(&self, event: &str, n: usize) -> Option<Signal> {
        self.signals().into_iter().filter(|s| s.event() == event).nth(n)
    }
}

#[async_trait]
impl SignalSink for RecordingSink {
    async fn send(&self, signal: Signal) -> Result<()> {
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }
}

/// ========== WAITING ==========

pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_phase(handle: &SessionHandle, phase: Phase) {
    let mut status = handle.watch();
    let res = tokio::time::timeout(Duration::from_secs(3), status.wait_for(|s| s.phase == phase)).await;
    let reached = res.map(|r| r.is_ok()).unwrap_or(false);
    assert!(
        reached,
        "phase {phase:?} not reached, last status {:?}",
        handle.status()
    );
}

/// Дать циклу роли разобрать всё, что уже в очереди
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
