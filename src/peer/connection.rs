use crate::error::{Error, Result};
use crate::logger::dump_candidate;
use crate::media::MediaTrack;
use crate::negotiator::Event;
use crate::peer::ice::local_candidate;
use crate::peer::types::{
    ConnectivityState, IceCandidate, RemoteTrack, SdpKind, SessionDescription, TrackKind,
    TransportEvent,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// ========== SEAMS ==========

/// Низкоуровневое соединение одной эпохи
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Фабрика соединений
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerHandle>>;
}

/// Колбэки транспорта → цикл роли, с меткой эпохи соединения
#[derive(Clone)]
pub struct TransportEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl TransportEvents {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// `false` если роль уже завершилась
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Event::Transport {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// ========== WEBRTC-RS ==========

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = Error;

    fn try_from(d: RTCSessionDescription) -> Result<Self> {
        let kind = match d.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                return Err(Error::Negotiation(format!(
                    "unsupported description type {other}"
                )))
            }
        };
        Ok(SessionDescription { kind, sdp: d.sdp })
    }
}

fn to_rtc(d: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match d.kind {
        SdpKind::Offer => RTCSessionDescription::offer(d.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(d.sdp)?,
    })
}

fn connectivity(st: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match st {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Транспорт на webrtc-rs
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerHandle>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await?);
        let epoch = events.epoch();
        info!(epoch, "Peer connection created");

        let ev = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => {
                    if let Some(candidate) = local_candidate(&c) {
                        dump_candidate("LOCAL", &candidate);
                        ev.emit(TransportEvent::CandidateGenerated(candidate));
                    }
                }
                // cand == None означает конец сбора
                None => {
                    ev.emit(TransportEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            debug!(epoch, "ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(epoch, "ICE connection state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let ev = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!(epoch, "Peer connection state changed to: {:?}", st);
            if let Some(state) = connectivity(st) {
                ev.emit(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let ev = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                ev.emit(TransportEvent::TrackReceived(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    inner: Some(track),
                }));
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let sender = self.pc.add_track(track.track.clone()).await?;
        // RTCP читаем, чтобы работали интерсепторы
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.pc.create_offer(None).await?.try_into()
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.pc.create_answer(None).await?.try_into()
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        Ok(self.pc.set_local_description(to_rtc(description)?).await?)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(to_rtc(description)?).await?)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let d = self.pc.local_description().await?;
        d.try_into().ok()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate.into()).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(self.pc.close().await?)
    }
}
