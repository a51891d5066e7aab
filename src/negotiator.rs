//! Общий автомат согласования для обеих ролей.
//!
//! Все колбэки транспорта, входящие сигналы, завершения асинхронных шагов и
//! команды управления проходят через один канал и обрабатываются по одному.
//! Асинхронные шаги (захват медиа, создание соединения, offer/answer,
//! описания) выполняются отдельными задачами и возвращают результат с меткой
//! эпохи; результат устаревшей эпохи выбрасывается, а захваченные им ресурсы
//! освобождаются.

use crate::error::Result;
use crate::logger::Emitter;
use crate::media::{acquire_with_fallback, Constraints, LocalMedia, MediaAcquirer, MediaError, MediaTrack};
use crate::peer::connection::{PeerHandle, Transport, TransportEvents};
use crate::peer::ice::{analyze_candidates, EarlyCandidates};
use crate::peer::state::{ConnectionSlot, EpochClock};
use crate::peer::types::{ConnectivityState, IceCandidate, SessionDescription, TransportEvent};
use crate::signaling::{OfferHistory, Outbox, SessionTag, Signal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Источник камеры, инициатор
    Streamer,
    /// Приёмник, отвечает на offer
    Viewer,
}

impl Role {
    pub fn initiates(self) -> bool {
        self == Role::Streamer
    }

    fn peer_name(self) -> &'static str {
        match self {
            Role::Streamer => "viewer",
            Role::Viewer => "streamer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Streamer => f.write_str("streamer"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

/// Чем роли отличаются: кто начинает и откуда берётся локальное медиа
#[async_trait]
pub trait RoleStrategy: Send + Sync + 'static {
    fn role(&self) -> Role;

    /// Вызывается при входе в Idle у инициатора
    async fn acquire_local_media(&self) -> std::result::Result<Option<Arc<dyn LocalMedia>>, MediaError>;
}

pub struct Streamer {
    acquirer: Arc<dyn MediaAcquirer>,
    primary: Constraints,
    fallback: Constraints,
}

impl Streamer {
    pub fn new(acquirer: Arc<dyn MediaAcquirer>, primary: Constraints, fallback: Constraints) -> Self {
        Self {
            acquirer,
            primary,
            fallback,
        }
    }
}

#[async_trait]
impl RoleStrategy for Streamer {
    fn role(&self) -> Role {
        Role::Streamer
    }

    async fn acquire_local_media(&self) -> std::result::Result<Option<Arc<dyn LocalMedia>>, MediaError> {
        acquire_with_fallback(self.acquirer.as_ref(), &self.primary, &self.fallback)
            .await
            .map(Some)
    }
}

pub struct Viewer;

#[async_trait]
impl RoleStrategy for Viewer {
    fn role(&self) -> Role {
        Role::Viewer
    }

    async fn acquire_local_media(&self) -> std::result::Result<Option<Arc<dyn LocalMedia>>, MediaError> {
        Ok(None)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Negotiating,
    Connected,
    /// Попытка остановлена ошибкой; ждём внешний restart
    Halted,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub role: Role,
    pub phase: Phase,
    pub epoch: u64,
    /// Нет активной сессии (viewer)
    pub waiting: bool,
    pub connectivity: Option<ConnectivityState>,
    /// Метка, которой помечаются исходящие сообщения текущего соединения
    pub tag: Option<SessionTag>,
}

pub(crate) enum Event {
    Signal(Signal),
    Transport { epoch: u64, event: TransportEvent },
    Step { epoch: u64, step: Step },
    Control(Control),
}

pub(crate) enum Step {
    MediaAcquired(std::result::Result<Option<Arc<dyn LocalMedia>>, MediaError>),
    HandleCreated(Result<Arc<dyn PeerHandle>>),
    RemoteApplied(Result<()>),
    LocalSent(Result<()>),
}

pub(crate) enum Control {
    Reset,
    Restart,
    Shutdown(oneshot::Sender<()>),
}

/// Куда относится входящая метка
#[derive(Debug, PartialEq, Eq)]
enum TagFit {
    Current,
    Early,
    Stale,
}

pub(crate) struct Negotiator {
    strategy: Arc<dyn RoleStrategy>,
    pub(crate) role: Role,
    transport: Arc<dyn Transport>,
    outbox: Outbox,
    pub(crate) slot: ConnectionSlot,
    pub(crate) media: Option<Arc<dyn LocalMedia>>,
    session_id: String,
    /// viewer: offer текущего соединения
    pub(crate) accepted: Option<SessionTag>,
    /// viewer: принятые offer, переживают reset
    offers: OfferHistory,
    pub(crate) pending_offer: Option<SessionDescription>,
    early: EarlyCandidates,
    pub(crate) local_candidates: Vec<IceCandidate>,
    pub(crate) phase: Phase,
    pub(crate) connectivity: Option<ConnectivityState>,
    /// Запущенные шаги, чей результат ещё не вернулся
    in_flight: usize,
    /// Shutdown ждёт возврата шагов в полёте
    stopping: Option<oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<Event>,
    pub(crate) emitter: Emitter,
    status: watch::Sender<Status>,
}

impl Negotiator {
    pub(crate) fn new(
        strategy: Arc<dyn RoleStrategy>,
        transport: Arc<dyn Transport>,
        outbox: Outbox,
        events: mpsc::UnboundedSender<Event>,
        emitter: Emitter,
        status: watch::Sender<Status>,
    ) -> Self {
        let role = strategy.role();
        // у streamer первое соединение имеет эпоху 1, viewer получает её с первым offer
        let first_epoch = if role.initiates() { 1 } else { 0 };
        Self {
            strategy,
            role,
            transport,
            outbox,
            slot: ConnectionSlot::new(EpochClock::starting_at(first_epoch)),
            media: None,
            session_id: crate::utils::random_id(),
            accepted: None,
            offers: OfferHistory::default(),
            pending_offer: None,
            early: EarlyCandidates::default(),
            local_candidates: Vec::new(),
            phase: Phase::Idle,
            connectivity: None,
            in_flight: 0,
            stopping: None,
            events,
            emitter,
            status,
        }
    }

    pub(crate) fn initial_status(role: Role) -> Status {
        Status {
            role,
            phase: Phase::Idle,
            epoch: if role.initiates() { 1 } else { 0 },
            waiting: !role.initiates(),
            connectivity: None,
            tag: None,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!(role = %self.role, session = %self.session_id, "Role instance started");
        self.enter_idle();
        self.publish();

        while let Some(event) = rx.recv().await {
            if self.phase == Phase::Stopped {
                // после shutdown только освобождаем то, что вернули шаги
                if let Event::Step { epoch, step } = event {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.discard_step(epoch, step).await;
                }
                if self.in_flight == 0 {
                    if let Some(done) = self.stopping.take() {
                        let _ = done.send(());
                    }
                    break;
                }
                continue;
            }

            match event {
                Event::Signal(signal) => self.on_signal(signal).await,
                Event::Transport { epoch, event } => self.on_transport(epoch, event).await,
                Event::Step { epoch, step } => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.on_step(epoch, step).await
                }
                Event::Control(Control::Reset) => self.reset().await,
                Event::Control(Control::Restart) => self.restart(),
                Event::Control(Control::Shutdown(done)) => {
                    self.shutdown().await;
                    self.publish();
                    if self.in_flight == 0 {
                        let _ = done.send(());
                        break;
                    }
                    debug!(in_flight = self.in_flight, "Waiting for in-flight steps before stopping");
                    self.stopping = Some(done);
                    continue;
                }
            }
            self.publish();
        }
        debug!(role = %self.role, "Role loop finished");
    }

    fn publish(&self) {
        self.status.send_replace(Status {
            role: self.role,
            phase: self.phase,
            epoch: self.slot.epoch(),
            waiting: !self.role.initiates() && self.accepted.is_none() && self.phase != Phase::Stopped,
            connectivity: self.connectivity,
            tag: self.wire_tag(),
        });
    }

    /// Метка исходящих сообщений текущего соединения
    fn wire_tag(&self) -> Option<SessionTag> {
        if self.role.initiates() {
            Some(SessionTag {
                session: self.session_id.clone(),
                epoch: self.slot.epoch(),
            })
        } else {
            self.accepted.clone()
        }
    }

    fn spawn_step<F>(&mut self, epoch: u64, step: F)
    where
        F: Future<Output = Step> + Send + 'static,
    {
        self.in_flight += 1;
        let tx = self.events.clone();
        tokio::spawn(async move {
            let step = step.await;
            let _ = tx.send(Event::Step { epoch, step });
        });
    }

    /// ========== IDLE ==========

    pub(crate) fn enter_idle(&mut self) {
        self.phase = Phase::Idle;
        self.connectivity = None;
        self.local_candidates.clear();
        if self.role.initiates() {
            let epoch = self.slot.epoch();
            info!(epoch, "Acquiring local media");
            let strategy = self.strategy.clone();
            self.spawn_step(epoch, async move {
                Step::MediaAcquired(strategy.acquire_local_media().await)
            });
        } else {
            self.accepted = None;
            self.pending_offer = None;
            self.emitter.emit_waiting();
        }
    }

    fn create_connection(&mut self, epoch: u64) {
        let transport = self.transport.clone();
        let events = TransportEvents::new(epoch, self.events.clone());
        self.spawn_step(epoch, async move {
            Step::HandleCreated(transport.create(events).await)
        });
    }

    /// ========== STEP COMPLETIONS ==========

    async fn on_step(&mut self, epoch: u64, step: Step) {
        if !self.slot.clock().is_current(epoch) {
            self.discard_step(epoch, step).await;
            return;
        }

        match step {
            Step::MediaAcquired(Ok(media)) => {
                if let Some(m) = &media {
                    self.emitter.emit_media(m.id());
                }
                self.media = media;
                self.create_connection(epoch);
            }
            Step::MediaAcquired(Err(e)) => {
                self.phase = Phase::Halted;
                self.emitter
                    .emit_halted(epoch, format!("Error in streamer setup: {e}"));
            }
            Step::HandleCreated(Ok(handle)) => {
                if let Err(e) = self.slot.install(handle.clone()) {
                    self.emitter.emit_problem(epoch, e.to_string());
                    close_quietly(handle).await;
                    return;
                }
                self.phase = Phase::Negotiating;
                if self.role.initiates() {
                    self.spawn_offer(epoch, handle);
                } else if let Some(offer) = self.pending_offer.take() {
                    if self.slot.claim_remote() {
                        self.spawn_remote(epoch, handle, offer);
                    }
                }
            }
            Step::HandleCreated(Err(e)) => {
                if self.role.initiates() {
                    if let Some(media) = self.media.take() {
                        media.stop();
                    }
                    self.phase = Phase::Halted;
                    self.emitter
                        .emit_halted(epoch, format!("Failed to create peer connection: {e}"));
                } else {
                    self.emitter
                        .emit_problem(epoch, format!("Failed to create peer connection: {e}"));
                    self.enter_idle();
                }
            }
            Step::RemoteApplied(res) => {
                self.slot.mark_remote_applied(res.is_ok());
                match res {
                    Ok(()) => {
                        info!(epoch, "Remote description set");
                        self.flush_pending(epoch);
                        if !self.role.initiates() {
                            if let Some(handle) = self.slot.handle() {
                                self.spawn_answer(epoch, handle);
                            }
                        }
                    }
                    Err(e) if e.is_superseded() => debug!(epoch, "Remote description superseded"),
                    Err(e) => self
                        .emitter
                        .emit_problem(epoch, format!("Error setting remote description: {e}")),
                }
            }
            Step::LocalSent(Ok(())) => {
                info!(epoch, "Local description sent to {}", self.role.peer_name());
            }
            Step::LocalSent(Err(e)) if e.is_superseded() => {
                debug!(epoch, "Local negotiation superseded");
            }
            Step::LocalSent(Err(e)) => {
                self.emitter
                    .emit_problem(epoch, format!("Error in {} setup: {e}", self.role));
            }
        }
    }

    /// Результат устаревшей эпохи: освободить то, что он принёс
    async fn discard_step(&mut self, epoch: u64, step: Step) {
        debug!(epoch, current = self.slot.epoch(), "Discarding stale step completion");
        match step {
            Step::MediaAcquired(Ok(Some(media))) => media.stop(),
            Step::HandleCreated(Ok(handle)) => close_quietly(handle).await,
            _ => {}
        }
    }

    fn spawn_offer(&mut self, epoch: u64, handle: Arc<dyn PeerHandle>) {
        let tracks = self.media.as_ref().map(|m| m.tracks()).unwrap_or_default();
        let clock = self.slot.clock().clone();
        let outbox = self.outbox.clone();
        let Some(tag) = self.wire_tag() else { return };
        self.spawn_step(epoch, async move {
            Step::LocalSent(send_offer(handle, tracks, clock, epoch, tag, outbox).await)
        });
    }

    fn spawn_remote(&mut self, epoch: u64, handle: Arc<dyn PeerHandle>, description: SessionDescription) {
        let clock = self.slot.clock().clone();
        self.spawn_step(epoch, async move {
            let res = async {
                clock.ensure(epoch)?;
                handle.set_remote_description(description).await
            }
            .await;
            Step::RemoteApplied(res)
        });
    }

    fn spawn_answer(&mut self, epoch: u64, handle: Arc<dyn PeerHandle>) {
        let clock = self.slot.clock().clone();
        let outbox = self.outbox.clone();
        let Some(tag) = self.wire_tag() else { return };
        self.spawn_step(epoch, async move {
            Step::LocalSent(send_answer(handle, clock, epoch, tag, outbox).await)
        });
    }

    fn flush_pending(&mut self, epoch: u64) {
        let pending = self.slot.pool.drain();
        let Some(handle) = self.slot.handle() else { return };
        if pending.is_empty() {
            return;
        }
        debug!(epoch, count = pending.len(), "Applying queued candidates");
        let clock = self.slot.clock().clone();
        tokio::spawn(async move {
            for candidate in pending {
                if clock.ensure(epoch).is_err() {
                    break;
                }
                if let Err(e) = handle.add_ice_candidate(candidate).await {
                    warn!(epoch, "Error adding received ICE candidate: {e}");
                }
            }
        });
    }

    /// ========== SIGNALS ==========

    async fn on_signal(&mut self, signal: Signal) {
        match (self.role, signal) {
            (Role::Viewer, Signal::Offer { tag, description, .. }) => {
                self.on_offer(tag, description).await
            }
            (Role::Streamer, Signal::Answer { tag, description, .. }) => {
                self.on_answer(tag, description)
            }
            (Role::Viewer, Signal::StreamerIceCandidate { tag, candidate, .. })
            | (Role::Streamer, Signal::ReceiverIceCandidate { tag, candidate, .. }) => {
                self.on_remote_candidate(tag, candidate)
            }
            (role, other) => {
                debug!(%role, event = other.event(), "Ignoring signal not addressed to this role");
            }
        }
    }

    async fn on_offer(&mut self, tag: SessionTag, description: SessionDescription) {
        if self.offers.is_stale(&tag) {
            if self.offers.is_retired(&tag.session) {
                warn!(%tag, "Discarding offer from a replaced streamer");
            } else if let Some(last) = self.offers.last() {
                warn!(%tag, newest = %last, "Discarding stale or duplicate offer");
            }
            return;
        }
        info!(%tag, "Offer received");

        // прежнее соединение, даже недосозданное, вытесняется
        match self.slot.destroy() {
            Some(old) => {
                info!("Superseding previous connection");
                close_quietly(old).await;
            }
            None => {
                self.slot.begin_epoch();
            }
        }
        let epoch = self.slot.epoch();

        self.offers.accept(tag.clone());
        self.accepted = Some(tag.clone());
        self.pending_offer = Some(description);
        self.local_candidates.clear();
        self.connectivity = None;
        let offers = &self.offers;
        for candidate in self.early.release(&tag, |t| offers.is_stale(t)) {
            if self.slot.pool.admit(&candidate) {
                self.slot.pool.defer(candidate);
            }
        }
        self.phase = Phase::Negotiating;
        self.emitter.emit_accepted(epoch);
        self.create_connection(epoch);
    }

    fn on_answer(&mut self, tag: SessionTag, description: SessionDescription) {
        let Some(current) = self.wire_tag() else { return };
        if tag != current {
            warn!(%tag, %current, "Discarding answer for stale epoch");
            return;
        }
        let Some(handle) = self.slot.handle() else {
            warn!(%tag, "No peer connection available for answer");
            return;
        };
        if !self.slot.claim_remote() {
            debug!(%tag, "Remote description already set, ignoring duplicate answer");
            return;
        }
        info!(%tag, "Setting remote description");
        self.spawn_remote(current.epoch, handle, description);
    }

    fn fit(&self, tag: &SessionTag) -> TagFit {
        if self.wire_tag().as_ref() == Some(tag) {
            return TagFit::Current;
        }
        if self.role.initiates() {
            return TagFit::Stale;
        }
        if self.offers.is_stale(tag) {
            TagFit::Stale
        } else {
            TagFit::Early
        }
    }

    fn on_remote_candidate(&mut self, tag: SessionTag, candidate: IceCandidate) {
        match self.fit(&tag) {
            TagFit::Current => {}
            TagFit::Early => {
                debug!(%tag, "Candidate ahead of its offer, holding");
                self.early.hold(tag, candidate);
                return;
            }
            TagFit::Stale => {
                warn!(%tag, current = self.slot.epoch(), "Discarding candidate for stale epoch");
                return;
            }
        }

        if !self.slot.pool.admit(&candidate) {
            debug!("Duplicate candidate ignored");
            return;
        }
        match self.slot.handle() {
            Some(handle) if self.slot.remote_applied() => {
                debug!("Adding received ICE candidate");
                let epoch = self.slot.epoch();
                tokio::spawn(async move {
                    if let Err(e) = handle.add_ice_candidate(candidate).await {
                        warn!(epoch, "Error adding received ICE candidate: {e}");
                    }
                });
            }
            _ => self.slot.pool.defer(candidate),
        }
    }

    /// ========== TRANSPORT EVENTS ==========

    async fn on_transport(&mut self, epoch: u64, event: TransportEvent) {
        if !self.slot.clock().is_current(epoch) {
            debug!(epoch, current = self.slot.epoch(), "Dropping event from superseded connection");
            return;
        }
        match event {
            TransportEvent::CandidateGenerated(candidate) => {
                self.local_candidates.push(candidate.clone());
                let Some(tag) = self.wire_tag() else { return };
                let signal = match self.role {
                    Role::Streamer => Signal::streamer_candidate(tag, candidate),
                    Role::Viewer => Signal::receiver_candidate(tag, candidate),
                };
                debug!("Sending ICE candidate to {}", self.role.peer_name());
                if let Err(e) = self.outbox.push(signal) {
                    warn!("Failed to queue ICE candidate: {e}");
                }
            }
            TransportEvent::GatheringComplete => {
                info!(epoch, count = self.local_candidates.len(), "ICE candidate gathering completed");
                analyze_candidates(&self.local_candidates);
            }
            TransportEvent::StateChanged(state) => self.on_state_changed(state).await,
            TransportEvent::TrackReceived(track) => self.emitter.emit_track(track),
        }
    }
}

async fn send_offer(
    handle: Arc<dyn PeerHandle>,
    tracks: Vec<MediaTrack>,
    clock: EpochClock,
    epoch: u64,
    tag: SessionTag,
    outbox: Outbox,
) -> Result<()> {
    for track in &tracks {
        handle.add_track(track).await?;
    }
    clock.ensure(epoch)?;
    let offer = handle.create_offer().await?;
    clock.ensure(epoch)?;
    info!(epoch, "Setting local description");
    handle.set_local_description(offer.clone()).await?;
    clock.ensure(epoch)?;
    let description = handle.local_description().await.unwrap_or(offer);
    info!(%tag, "Sending offer to viewer");
    outbox.push(Signal::offer(tag, description))
}

async fn send_answer(
    handle: Arc<dyn PeerHandle>,
    clock: EpochClock,
    epoch: u64,
    tag: SessionTag,
    outbox: Outbox,
) -> Result<()> {
    info!(epoch, "Creating answer");
    let answer = handle.create_answer().await?;
    clock.ensure(epoch)?;
    info!(epoch, "Setting local description");
    handle.set_local_description(answer.clone()).await?;
    clock.ensure(epoch)?;
    let description = handle.local_description().await.unwrap_or(answer);
    info!(%tag, "Sending answer");
    outbox.push(Signal::answer(tag, description))
}

pub(crate) async fn close_quietly(handle: Arc<dyn PeerHandle>) {
    if let Err(e) = handle.close().await {
        warn!("Failed to close peer connection: {e}");
    }
}
