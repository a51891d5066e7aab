use crate::error::{Error, Result};
use crate::logger::{Emitter, SessionEvent};
use crate::negotiator::{Control, Event, Negotiator, RoleStrategy, Status};
use crate::peer::connection::Transport;
use crate::signaling::{Outbox, Signal, SignalSink};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Управление запущенным экземпляром роли
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<Status>,
    emitter: Emitter,
}

/// Запускает роль на текущем runtime tokio
pub fn spawn(
    strategy: Arc<dyn RoleStrategy>,
    transport: Arc<dyn Transport>,
    signaling: Arc<dyn SignalSink>,
) -> SessionHandle {
    let role = strategy.role();
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(Negotiator::initial_status(role));
    let emitter = Emitter::new(role);
    let outbox = Outbox::spawn(signaling);

    let negotiator = Negotiator::new(
        strategy,
        transport,
        outbox,
        tx.clone(),
        emitter.clone(),
        status_tx,
    );
    tokio::spawn(negotiator.run(rx));

    SessionHandle {
        tx,
        status: status_rx,
        emitter,
    }
}

impl SessionHandle {
    /// Входящее сообщение сигнального канала
    pub fn deliver(&self, signal: Signal) -> Result<()> {
        self.tx
            .send(Event::Signal(signal))
            .map_err(|_| Error::SessionClosed)
    }

    /// Перекачивает входящий поток сигналов в роль
    pub fn pump(&self, mut inbound: mpsc::UnboundedReceiver<Signal>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = inbound.recv().await {
                if handle.deliver(signal).is_err() {
                    break;
                }
            }
            debug!("Signal pump finished");
        })
    }

    pub fn reset(&self) -> Result<()> {
        self.control(Control::Reset)
    }

    /// Повторная попытка после `Phase::Halted`
    pub fn restart(&self) -> Result<()> {
        self.control(Control::Restart)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.control(Control::Shutdown(done_tx))?;
        done_rx.await?;
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.emitter.subscribe()
    }

    fn control(&self, control: Control) -> Result<()> {
        self.tx
            .send(Event::Control(control))
            .map_err(|_| Error::SessionClosed)
    }
}
