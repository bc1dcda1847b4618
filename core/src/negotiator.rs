//! Link Negotiator.
//!
//! Chooses a transport for each discovered peer and drives the handshake
//! state machine:
//!
//! Idle -> Discovering -> Negotiating -> Established -> Closing -> Closed
//!
//! At most one negotiation exists per peer. Handshake timeouts retry with
//! transport re-selection, excluding the transport that just failed; once
//! retries are exhausted the session closes permanently.

use crate::config::EngineConfig;
use crate::registry::PeerId;
use crate::transport::{TransportCapability, TransportKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lifecycle of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    Idle,
    Discovering,
    Negotiating,
    Established,
    Closing,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "Idle",
            NegotiationState::Discovering => "Discovering",
            NegotiationState::Negotiating => "Negotiating",
            NegotiationState::Established => "Established",
            NegotiationState::Closing => "Closing",
            NegotiationState::Closed => "Closed",
        };
        write!(f, "{}", s)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Handshake retries exhausted
    Timeout,
    /// Fatal transport error on an established link
    TransportFailure,
    /// Explicit close or engine shutdown
    Shutdown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Timeout => "Timeout",
            FailureReason::TransportFailure => "TransportFailure",
            FailureReason::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

/// A transport the peer was recently sighted on, with its signal quality
#[derive(Debug, Clone, Copy)]
pub struct TransportCandidate {
    pub kind: TransportKind,
    pub signal_hint: f64,
}

/// One negotiation attempt per peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSession {
    pub peer_id: PeerId,
    pub chosen_transport: Option<TransportKind>,
    pub state: NegotiationState,
    pub retry_count: u32,
    pub created_at_ms: u64,
    /// Handshake deadline while Negotiating
    pub deadline_ms: Option<u64>,
    /// Transports that already failed a handshake for this session
    pub excluded: HashSet<TransportKind>,
    pub failure: Option<FailureReason>,
}

impl NegotiationSession {
    fn new(peer_id: PeerId, now_ms: u64) -> Self {
        Self {
            peer_id,
            chosen_transport: None,
            state: NegotiationState::Discovering,
            retry_count: 0,
            created_at_ms: now_ms,
            deadline_ms: None,
            excluded: HashSet::new(),
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == NegotiationState::Closed
    }
}

#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("No eligible transport for peer {0}")]
    NoEligibleTransport(PeerId),

    #[error("No negotiation session for peer {0}")]
    UnknownPeer(PeerId),

    #[error("Unexpected handshake ack for peer {0} in state {1}")]
    UnexpectedAck(PeerId, NegotiationState),
}

/// A negotiation whose handshake deadline passed
#[derive(Debug, Clone)]
pub struct TimedOut {
    pub peer_id: PeerId,
    pub failed_transport: Option<TransportKind>,
    /// True when retries are exhausted and the session closed permanently
    pub exhausted: bool,
}

/// Drives transport selection and the handshake state machine for all peers
pub struct LinkNegotiator {
    sessions: Arc<RwLock<HashMap<PeerId, NegotiationSession>>>,
    capabilities: Arc<RwLock<HashMap<TransportKind, TransportCapability>>>,
    config: EngineConfig,
}

impl LinkNegotiator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            capabilities: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Record a transport's capability for scoring
    pub fn set_capability(&self, capability: TransportCapability) {
        self.capabilities
            .write()
            .insert(capability.kind, capability);
    }

    /// Registry reported a peer sighting; creates the Discovering session on
    /// first contact. Returns true when a new session was created.
    pub fn peer_seen(&self, peer_id: &PeerId, now_ms: u64) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(peer_id) {
            return false;
        }
        sessions.insert(peer_id.clone(), NegotiationSession::new(peer_id.clone(), now_ms));
        debug!("Peer {} entered Discovering", peer_id);
        true
    }

    /// Select a transport and move to Negotiating.
    ///
    /// Idempotent: while a negotiation is in flight (or the session is
    /// established or terminally closed) the existing session is returned
    /// unchanged rather than starting a second one.
    pub fn negotiate(
        &self,
        peer_id: &PeerId,
        candidates: &[TransportCandidate],
        now_ms: u64,
    ) -> Result<NegotiationSession, NegotiationError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(peer_id.clone())
            .or_insert_with(|| NegotiationSession::new(peer_id.clone(), now_ms));

        match session.state {
            NegotiationState::Negotiating
            | NegotiationState::Established
            | NegotiationState::Closing
            | NegotiationState::Closed => {
                return Ok(session.clone());
            }
            NegotiationState::Idle | NegotiationState::Discovering => {}
        }

        let eligible: Vec<TransportCandidate> = candidates
            .iter()
            .filter(|c| !session.excluded.contains(&c.kind))
            .copied()
            .collect();
        // Exclusion is a preference: if every remaining transport already
        // failed once, retry over the full candidate set.
        let pool = if eligible.is_empty() {
            debug!(
                "Peer {}: all candidates previously failed, retrying full set",
                peer_id
            );
            candidates.to_vec()
        } else {
            eligible
        };

        let chosen = self.select_best(&pool);
        let chosen = match chosen {
            Some(kind) => kind,
            None => return Err(NegotiationError::NoEligibleTransport(peer_id.clone())),
        };

        session.chosen_transport = Some(chosen);
        session.state = NegotiationState::Negotiating;
        session.deadline_ms = Some(now_ms + self.config.handshake_timeout_ms);
        info!("Peer {}: negotiating over {}", peer_id, chosen);
        Ok(session.clone())
    }

    /// Handshake ack from the chosen transport: Negotiating -> Established
    pub fn handshake_acked(
        &self,
        peer_id: &PeerId,
        _now_ms: u64,
    ) -> Result<NegotiationSession, NegotiationError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(peer_id)
            .ok_or_else(|| NegotiationError::UnknownPeer(peer_id.clone()))?;

        match session.state {
            NegotiationState::Negotiating => {
                session.state = NegotiationState::Established;
                session.deadline_ms = None;
                info!(
                    "Peer {}: established over {}",
                    peer_id,
                    session
                        .chosen_transport
                        .map(|k| k.to_string())
                        .unwrap_or_default()
                );
                Ok(session.clone())
            }
            // A duplicate ack for an established link is harmless
            NegotiationState::Established => Ok(session.clone()),
            state => Err(NegotiationError::UnexpectedAck(peer_id.clone(), state)),
        }
    }

    /// Expire handshakes whose deadline passed.
    ///
    /// Each timed-out negotiation drops back to Discovering with the failed
    /// transport excluded, or closes permanently with `FailureReason::Timeout`
    /// once `max_retries` is reached. Closed sessions never re-enter
    /// Discovering.
    pub fn check_timeouts(&self, now_ms: u64) -> Vec<TimedOut> {
        let mut sessions = self.sessions.write();
        let mut timed_out = Vec::new();

        for session in sessions.values_mut() {
            if session.state != NegotiationState::Negotiating {
                continue;
            }
            match session.deadline_ms {
                Some(deadline) if now_ms >= deadline => {}
                _ => continue,
            }

            let failed = session.chosen_transport.take();
            if let Some(kind) = failed {
                session.excluded.insert(kind);
            }
            session.retry_count += 1;
            session.deadline_ms = None;

            if session.retry_count >= self.config.max_retries {
                session.state = NegotiationState::Closed;
                session.failure = Some(FailureReason::Timeout);
                warn!(
                    "Peer {}: negotiation failed permanently after {} timeouts",
                    session.peer_id, session.retry_count
                );
                timed_out.push(TimedOut {
                    peer_id: session.peer_id.clone(),
                    failed_transport: failed,
                    exhausted: true,
                });
            } else {
                session.state = NegotiationState::Discovering;
                debug!(
                    "Peer {}: handshake timeout on {:?}, retry {}/{}",
                    session.peer_id, failed, session.retry_count, self.config.max_retries
                );
                timed_out.push(TimedOut {
                    peer_id: session.peer_id.clone(),
                    failed_transport: failed,
                    exhausted: false,
                });
            }
        }
        timed_out
    }

    /// Close a session: Closing -> Closed, recording the reason. Idempotent.
    pub fn close(&self, peer_id: &PeerId, reason: FailureReason) -> Option<NegotiationSession> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(peer_id)?;
        if session.state == NegotiationState::Closed {
            return Some(session.clone());
        }
        // In-flight operations observe Closing before the final transition.
        session.state = NegotiationState::Closing;
        session.state = NegotiationState::Closed;
        session.deadline_ms = None;
        session.failure = Some(reason);
        info!("Peer {}: negotiation closed ({})", peer_id, reason);
        Some(session.clone())
    }

    /// Snapshot of one peer's session
    pub fn session(&self, peer_id: &PeerId) -> Option<NegotiationSession> {
        self.sessions.read().get(peer_id).cloned()
    }

    /// Snapshots of every tracked session
    pub fn sessions(&self) -> Vec<NegotiationSession> {
        self.sessions.read().values().cloned().collect()
    }

    /// Drop state for a pruned peer
    pub fn cleanup_peer(&self, peer_id: &PeerId) {
        self.sessions.write().remove(peer_id);
    }

    /// Weighted transport score; higher is better
    fn score(
        &self,
        candidate: &TransportCandidate,
        caps: &HashMap<TransportKind, TransportCapability>,
    ) -> f64 {
        let cap = caps
            .get(&candidate.kind)
            .cloned()
            .unwrap_or_else(|| TransportCapability::for_kind(candidate.kind));
        let throughput_norm = (cap.max_throughput_bps as f64 / 1_000_000_000.0).min(1.0);
        self.config.signal_weight * candidate.signal_hint
            + self.config.throughput_weight * throughput_norm
    }

    fn select_best(&self, pool: &[TransportCandidate]) -> Option<TransportKind> {
        let caps = self.capabilities.read();
        pool.iter()
            .max_by(|a, b| {
                let score_a = self.score(a, &caps);
                let score_b = self.score(b, &caps);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        // Equal scores: earlier in the priority order wins
                        self.config
                            .priority_index(b.kind)
                            .cmp(&self.config.priority_index(a.kind))
                    })
            })
            .map(|c| c.kind)
    }
}
