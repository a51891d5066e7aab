pub mod connection;
pub mod ice;
pub mod state;
pub mod types;

pub use connection::{PeerHandle, Transport, TransportEvents, WebRtcTransport};
pub use state::{ConnectionSlot, EpochClock};
pub use types::{
    ConnectivityState, IceCandidate, RemoteTrack, SdpKind, SessionDescription, ServerConfig,
    TrackKind, TransportEvent,
};
