//! Сообщения сигнального канала и их отправка.
//!
//! Сам relay внешний: он пересылает непрозрачные JSON-сообщения между двумя
//! сторонами. Ядро определяет только формат и порядок отправки.

pub mod relay;
pub mod websocket;

use crate::error::{Error, Result};
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Метка соединения, к которому относится сообщение.
///
/// `session` это случайный id экземпляра streamer, `epoch` его эпоха.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTag {
    pub session: String,
    pub epoch: u64,
}

impl SessionTag {
    /// Другой экземпляр streamer считается новее любого известного
    pub fn is_newer_than(&self, other: &SessionTag) -> bool {
        self.session != other.session || self.epoch > other.epoch
    }
}

/// Сколько заменённых экземпляров streamer помнит viewer
pub const RETIRED_SESSION_LIMIT: usize = 16;

/// Принятые viewer offer: самый новый и экземпляры streamer, которые он вытеснил.
///
/// Повторная доставка offer от вытесненного экземпляра не должна снова
/// забирать соединение у действующего.
#[derive(Debug, Default)]
pub struct OfferHistory {
    last: Option<SessionTag>,
    retired: VecDeque<String>,
}

impl OfferHistory {
    pub fn last(&self) -> Option<&SessionTag> {
        self.last.as_ref()
    }

    pub fn is_retired(&self, session: &str) -> bool {
        self.retired.iter().any(|s| s == session)
    }

    /// Метка не новее принятого offer или от вытесненного экземпляра
    pub fn is_stale(&self, tag: &SessionTag) -> bool {
        if self.is_retired(&tag.session) {
            return true;
        }
        match &self.last {
            Some(last) => !tag.is_newer_than(last),
            None => false,
        }
    }

    pub fn accept(&mut self, tag: SessionTag) {
        if let Some(prev) = self.last.take() {
            if prev.session != tag.session && !self.is_retired(&prev.session) {
                if self.retired.len() >= RETIRED_SESSION_LIMIT {
                    self.retired.pop_front();
                }
                self.retired.push_back(prev.session);
            }
        }
        self.last = Some(tag);
    }
}

impl std::fmt::Display for SessionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.session, self.epoch)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Signal {
    Offer {
        tag: SessionTag,
        description: SessionDescription,
        ts: i64,
    },
    Answer {
        tag: SessionTag,
        description: SessionDescription,
        ts: i64,
    },
    StreamerIceCandidate {
        tag: SessionTag,
        candidate: IceCandidate,
        ts: i64,
    },
    ReceiverIceCandidate {
        tag: SessionTag,
        candidate: IceCandidate,
        ts: i64,
    },
}

impl Signal {
    pub fn offer(tag: SessionTag, description: SessionDescription) -> Self {
        Signal::Offer {
            tag,
            description,
            ts: chrono::Utc::now().timestamp(),
        }
    }

    pub fn answer(tag: SessionTag, description: SessionDescription) -> Self {
        Signal::Answer {
            tag,
            description,
            ts: chrono::Utc::now().timestamp(),
        }
    }

    pub fn streamer_candidate(tag: SessionTag, candidate: IceCandidate) -> Self {
        Signal::StreamerIceCandidate {
            tag,
            candidate,
            ts: chrono::Utc::now().timestamp(),
        }
    }

    pub fn receiver_candidate(tag: SessionTag, candidate: IceCandidate) -> Self {
        Signal::ReceiverIceCandidate {
            tag,
            candidate,
            ts: chrono::Utc::now().timestamp(),
        }
    }

    pub fn tag(&self) -> &SessionTag {
        match self {
            Signal::Offer { tag, .. }
            | Signal::Answer { tag, .. }
            | Signal::StreamerIceCandidate { tag, .. }
            | Signal::ReceiverIceCandidate { tag, .. } => tag,
        }
    }

    /// Имя события на проводе
    pub fn event(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::StreamerIceCandidate { .. } => "streamer-ice-candidate",
            Signal::ReceiverIceCandidate { .. } => "receiver-ice-candidate",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Исходящая сторона сигнального канала
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, signal: Signal) -> Result<()>;
}

/// Упорядоченная очередь исходящих сообщений одной роли
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Outbox {
    pub fn spawn(sink: Arc<dyn SignalSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let event = signal.event();
                match sink.send(signal).await {
                    Ok(()) => debug!(event, "Signal sent"),
                    Err(e) => error!(event, "Failed to send signal: {e}"),
                }
            }
            debug!("Outbox drained");
        });
        Self { tx }
    }

    pub fn push(&self, signal: Signal) -> Result<()> {
        self.tx.send(signal).map_err(|_| Error::SignalingClosed)
    }
}
