use super::{Signal, SignalSink};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Клиент WebSocket relay: каждый сигнал идёт одним текстовым JSON-фреймом
pub struct WsSignaling {
    tx: mpsc::UnboundedSender<Message>,
}

impl WsSignaling {
    /// Подключается и возвращает отправитель и поток входящих сигналов
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<Signal>)> {
        info!("Connecting to signaling relay: {url}");
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(sender_task(write, rx));
        tokio::spawn(receiver_task(read, inbound_tx));

        Ok((Self { tx }, inbound_rx))
    }
}

#[async_trait]
impl SignalSink for WsSignaling {
    async fn send(&self, signal: Signal) -> Result<()> {
        let text = signal.to_json()?;
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::SignalingClosed)
    }
}

async fn sender_task(
    mut write: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write.send(msg).await {
            error!("Failed to send WebSocket message: {e}");
            break;
        }
    }
    debug!("Sender task terminated");
}

async fn receiver_task(
    mut read: futures::stream::SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<Signal>,
) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match Signal::from_json(&text) {
                Ok(signal) => {
                    if inbound.send(signal).is_err() {
                        debug!("Inbound consumer gone, stopping receiver");
                        break;
                    }
                }
                Err(e) => warn!("Ignoring unparsable signaling message: {e}"),
            },
            Ok(Message::Close(_)) => {
                info!("WebSocket connection closed");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {e}");
                break;
            }
            _ => {}
        }
    }
    debug!("Receiver task terminated");
}
