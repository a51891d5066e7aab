use crate::negotiator::Role;
use crate::peer::types::{IceCandidate, RemoteTrack};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Логирование: RUST_LOG, иначе фильтр из конфигурации
pub fn init(default_filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // повторная инициализация (тесты) не ошибка
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Что видно снаружи роли
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Нет активной сессии (viewer: показать «ожидание»)
    Waiting,
    /// Offer принят, ожидание снято
    SessionAccepted { epoch: u64 },
    MediaAcquired { media: String },
    Connected { epoch: u64 },
    ConnectionLost { epoch: u64 },
    RemoteTrack(RemoteTrack),
    /// Ошибка, не прервавшая работу роли
    Problem { epoch: u64, message: String },
    /// Попытка остановлена; нужен внешний restart
    Halted { epoch: u64, message: String },
    Stopped,
}

/// Побочный канал отчётов роли
#[derive(Clone)]
pub struct Emitter {
    role: Role,
    tx: broadcast::Sender<SessionEvent>,
}

impl Emitter {
    pub fn new(role: Role) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { role, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    fn emit_state(&self, evt: SessionEvent) {
        debug!(role = %self.role, "emit_state called with event: {:?}", evt);
        // отсутствие подписчиков не ошибка
        let _ = self.tx.send(evt);
    }

    pub fn emit_waiting(&self) {
        info!(role = %self.role, "Waiting for an offer");
        self.emit_state(SessionEvent::Waiting);
    }

    pub fn emit_accepted(&self, epoch: u64) {
        self.emit_state(SessionEvent::SessionAccepted { epoch });
    }

    pub fn emit_media(&self, media: &str) {
        self.emit_state(SessionEvent::MediaAcquired {
            media: media.to_owned(),
        });
    }

    pub fn emit_connected(&self, epoch: u64) {
        info!(role = %self.role, epoch, "Peer connection connected");
        self.emit_state(SessionEvent::Connected { epoch });
    }

    pub fn emit_connection_lost(&self, epoch: u64) {
        warn!(role = %self.role, epoch, "Connection lost. Resetting...");
        self.emit_state(SessionEvent::ConnectionLost { epoch });
    }

    pub fn emit_track(&self, track: RemoteTrack) {
        info!(role = %self.role, track = %track.id, kind = ?track.kind, "Stream received");
        self.emit_state(SessionEvent::RemoteTrack(track));
    }

    pub fn emit_problem(&self, epoch: u64, message: impl Into<String>) {
        let message = message.into();
        error!(role = %self.role, epoch, "{message}");
        self.emit_state(SessionEvent::Problem { epoch, message });
    }

    pub fn emit_halted(&self, epoch: u64, message: impl Into<String>) {
        let message = message.into();
        error!(role = %self.role, epoch, "Setup halted: {message}");
        self.emit_state(SessionEvent::Halted { epoch, message });
    }

    pub fn emit_stopped(&self) {
        self.emit_state(SessionEvent::Stopped);
    }
}
