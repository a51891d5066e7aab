use crate::peer::types::IceCandidate;
use crate::signaling::SessionTag;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};

/// Предел для кандидатов, пришедших раньше своего offer
pub const EARLY_CANDIDATE_LIMIT: usize = 64;

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

/// Локальный кандидат webrtc-rs → проводной формат
pub fn local_candidate(cand: &RTCIceCandidate) -> Option<IceCandidate> {
    match cand.to_json() {
        Ok(init) => Some(init.into()),
        Err(e) => {
            warn!("Failed to serialize local ICE candidate: {e}");
            None
        }
    }
}

/// Удалённые кандидаты текущего соединения
#[derive(Debug, Default)]
pub struct CandidatePool {
    pending: Vec<IceCandidate>,
    seen: HashSet<IceCandidate>,
}

impl CandidatePool {
    /// `false` если такой кандидат уже был (повторная доставка)
    pub fn admit(&mut self, candidate: &IceCandidate) -> bool {
        self.seen.insert(candidate.clone())
    }

    /// Откладываем до установки remote description
    pub fn defer(&mut self, candidate: IceCandidate) {
        debug!("Remote description not set yet, queuing candidate");
        self.pending.push(candidate);
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.seen.clear();
    }
}

/// Кандидаты от streamer, обогнавшие свой offer
#[derive(Debug, Default)]
pub struct EarlyCandidates {
    held: Vec<(SessionTag, IceCandidate)>,
}

impl EarlyCandidates {
    pub fn hold(&mut self, tag: SessionTag, candidate: IceCandidate) {
        if self.held.len() >= EARLY_CANDIDATE_LIMIT {
            warn!("Early candidate buffer full, dropping oldest");
            self.held.remove(0);
        }
        self.held.push((tag, candidate));
    }

    /// Отдаёт кандидатов принятого offer, устаревшие выбрасывает
    pub fn release(
        &mut self,
        accepted: &SessionTag,
        is_stale: impl Fn(&SessionTag) -> bool,
    ) -> Vec<IceCandidate> {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|(tag, _)| tag == accepted);
        self.held = rest.into_iter().filter(|(tag, _)| !is_stale(tag)).collect();
        matching.into_iter().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    info!(
        host = host_count,
        srflx = srflx_count,
        relay = relay_count,
        "Candidate analysis"
    );

    if relay_count == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
}
