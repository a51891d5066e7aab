//! Согласование WebRTC-сессии streamer → viewer через внешний сигнальный relay
//! с автоматическим восстановлением при деградации транспорта.

pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod negotiator;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod supervisor;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use logger::SessionEvent;
pub use negotiator::{Phase, Role, RoleStrategy, Status, Streamer, Viewer};
pub use session::{spawn, SessionHandle};
pub use signaling::{SessionTag, Signal, SignalSink};

use media::{FacingMode, StaticDevices};
use peer::WebRtcTransport;
use signaling::websocket::WsSignaling;
use std::sync::Arc;
use tracing::info;

/// Запуск роли поверх webrtc-rs и WebSocket relay до Ctrl+C
pub async fn run(config: Config, role: Role) -> Result<()> {
    let transport = Arc::new(WebRtcTransport::new(config.rtc_ice_servers())?);
    let (signaling, inbound) = WsSignaling::connect(&config.signaling_url).await?;

    let strategy: Arc<dyn RoleStrategy> = match role {
        Role::Streamer => Arc::new(Streamer::new(
            // реальный захват устройств вне ядра: треки ждут сэмплов извне
            Arc::new(StaticDevices::new(vec![FacingMode::User], true)),
            config.media.primary.clone(),
            config.media.fallback.clone(),
        )),
        Role::Viewer => Arc::new(Viewer),
    };

    let handle = spawn(strategy, transport, Arc::new(signaling));
    let pump = handle.pump(inbound);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, cleaning up...");
    handle.shutdown().await?;
    pump.abort();
    Ok(())
}
