//! Наблюдение за связностью и протокол сброса.
//!
//! Деградация (`disconnected`, `failed`) всегда ведёт к немедленному сбросу:
//! без бюджета попыток и задержек. Сам сброс не повторяет неудавшийся захват
//! медиа: после `Halted` нужен внешний `restart`.

use crate::negotiator::{close_quietly, Negotiator, Phase};
use crate::peer::types::ConnectivityState;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// new / connecting
    Transient,
    Degraded,
    /// Закрыто намеренно, не повод восстанавливаться
    Closed,
}

pub fn classify(state: ConnectivityState) -> Health {
    match state {
        ConnectivityState::Connected => Health::Healthy,
        ConnectivityState::New | ConnectivityState::Connecting => Health::Transient,
        ConnectivityState::Disconnected | ConnectivityState::Failed => Health::Degraded,
        ConnectivityState::Closed => Health::Closed,
    }
}

impl Negotiator {
    pub(crate) async fn on_state_changed(&mut self, state: ConnectivityState) {
        let epoch = self.slot.epoch();
        info!(epoch, %state, "Connection state change");
        self.connectivity = Some(state);

        match classify(state) {
            Health::Healthy => {
                self.phase = Phase::Connected;
                self.emitter.emit_connected(epoch);
            }
            Health::Transient => {}
            Health::Closed => debug!(epoch, "Connection closed, not a recovery trigger"),
            Health::Degraded => {
                self.emitter.emit_connection_lost(epoch);
                self.on_state_degraded().await;
            }
        }
    }

    pub(crate) async fn on_state_degraded(&mut self) {
        self.reset().await;
    }

    /// Закрыть соединение, освободить устройство, вернуться в Idle.
    /// Без активного соединения ничего не делает.
    pub(crate) async fn reset(&mut self) {
        let Some(handle) = self.slot.destroy() else {
            debug!(epoch = self.slot.epoch(), "Reset requested with no active connection");
            return;
        };
        info!(epoch = self.slot.epoch(), "Resetting connection");
        close_quietly(handle).await;

        // устройство освобождаем до повторного захвата
        if let Some(media) = self.media.take() {
            media.stop();
        }
        self.enter_idle();
    }

    /// Единственный внешний повторный запуск после остановленной попытки
    pub(crate) fn restart(&mut self) {
        if self.phase != Phase::Halted {
            debug!(phase = ?self.phase, "Restart ignored, attempt not halted");
            return;
        }
        info!(epoch = self.slot.epoch(), "Restarting halted attempt");
        self.enter_idle();
    }

    pub(crate) async fn shutdown(&mut self) {
        match self.slot.destroy() {
            Some(handle) => close_quietly(handle).await,
            // шаги в полёте должны вернуться уже устаревшими
            None => {
                self.slot.begin_epoch();
            }
        }
        if let Some(media) = self.media.take() {
            media.stop();
        }
        self.accepted = None;
        self.pending_offer = None;
        self.phase = Phase::Stopped;
        self.emitter.emit_stopped();
        info!(role = %self.role, "Role instance stopped");
    }
}
