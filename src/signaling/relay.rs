use super::{Signal, SignalSink};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Один конец in-process relay
pub struct RelayPort {
    name: &'static str,
    peer: mpsc::UnboundedSender<Signal>,
}

#[async_trait]
impl SignalSink for RelayPort {
    async fn send(&self, signal: Signal) -> Result<()> {
        debug!(port = self.name, event = signal.event(), "Relaying signal");
        self.peer.send(signal).map_err(|_| Error::SignalingClosed)
    }
}

/// Relay на двух участников внутри процесса: что отправил один, получает другой.
pub struct LocalRelay;

impl LocalRelay {
    /// `((streamer_port, streamer_inbox), (viewer_port, viewer_inbox))`
    #[allow(clippy::type_complexity)]
    pub fn pair() -> (
        (RelayPort, mpsc::UnboundedReceiver<Signal>),
        (RelayPort, mpsc::UnboundedReceiver<Signal>),
    ) {
        let (to_streamer, streamer_inbox) = mpsc::unbounded_channel();
        let (to_viewer, viewer_inbox) = mpsc::unbounded_channel();
        (
            (
                RelayPort {
                    name: "streamer",
                    peer: to_viewer,
                },
                streamer_inbox,
            ),
            (
                RelayPort {
                    name: "viewer",
                    peer: to_streamer,
                },
                viewer_inbox,
            ),
        )
    }
}
