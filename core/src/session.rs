//! Session Manager.
//!
//! Owns established sessions: heartbeat tracking, logical channel stats, and
//! idempotent teardown. A negotiation hands its session over here once it
//! reaches Established; from then on the Session Manager is the single owner
//! of the session map and everything else reads snapshot copies.

use crate::adapter::ChannelHandle;
use crate::negotiator::{FailureReason, NegotiationSession, NegotiationState};
use crate::registry::PeerId;
use crate::transport::TransportKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical channel statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// An established session with a peer over a chosen transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub peer_id: PeerId,
    pub transport: TransportKind,
    pub channel: ChannelHandle,
    pub last_heartbeat_ms: u64,
    pub stats: ChannelStats,
    pub closed: bool,
    pub close_reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session can only be registered in Established state, got {0}")]
    NotEstablished(NegotiationState),

    #[error("Negotiation for {0} has no chosen transport")]
    NoTransport(PeerId),

    #[error("Unknown session {0}")]
    UnknownSession(SessionId),
}

/// Owns all established sessions
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<SessionId, ActiveSession>>>,
    by_peer: Arc<RwLock<HashMap<PeerId, SessionId>>>,
    heartbeat_timeout_ms: u64,
}

impl SessionManager {
    pub fn new(heartbeat_timeout_ms: u64) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            by_peer: Arc::new(RwLock::new(HashMap::new())),
            heartbeat_timeout_ms,
        }
    }

    /// Take ownership of an established negotiation.
    ///
    /// Registering the same peer twice returns the live session instead of
    /// creating a duplicate.
    pub fn register(
        &self,
        negotiation: &NegotiationSession,
        channel: ChannelHandle,
        now_ms: u64,
    ) -> Result<ActiveSession, SessionError> {
        if negotiation.state != NegotiationState::Established {
            return Err(SessionError::NotEstablished(negotiation.state));
        }
        let transport = negotiation
            .chosen_transport
            .ok_or_else(|| SessionError::NoTransport(negotiation.peer_id.clone()))?;

        let mut by_peer = self.by_peer.write();
        let mut sessions = self.sessions.write();

        if let Some(existing_id) = by_peer.get(&negotiation.peer_id) {
            if let Some(existing) = sessions.get(existing_id) {
                if !existing.closed {
                    return Ok(existing.clone());
                }
            }
        }

        let session = ActiveSession {
            session_id: SessionId::new(),
            peer_id: negotiation.peer_id.clone(),
            transport,
            channel,
            last_heartbeat_ms: now_ms,
            stats: ChannelStats::default(),
            closed: false,
            close_reason: None,
        };
        by_peer.insert(session.peer_id.clone(), session.session_id.clone());
        sessions.insert(session.session_id.clone(), session.clone());
        info!(
            "Session {} registered for peer {} over {}",
            session.session_id, session.peer_id, transport
        );
        Ok(session)
    }

    /// Refresh a session's liveness
    pub fn heartbeat(&self, session_id: &SessionId, now_ms: u64) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        if !session.closed {
            session.last_heartbeat_ms = now_ms;
        }
        Ok(())
    }

    /// Account traffic on the session's logical channel
    pub fn record_traffic(
        &self,
        session_id: &SessionId,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        session.stats.bytes_sent += bytes_sent;
        session.stats.bytes_received += bytes_received;
        if bytes_sent > 0 {
            session.stats.messages_sent += 1;
        }
        if bytes_received > 0 {
            session.stats.messages_received += 1;
        }
        Ok(())
    }

    /// Close sessions whose last heartbeat exceeds the timeout.
    ///
    /// Best effort, never fails. Returns the newly expired ids; the caller is
    /// responsible for issuing the transport-level close for each.
    pub fn sweep(&self, now_ms: u64) -> Vec<SessionId> {
        let mut sessions = self.sessions.write();
        let mut expired = Vec::new();
        for session in sessions.values_mut() {
            if session.closed {
                continue;
            }
            if now_ms.saturating_sub(session.last_heartbeat_ms) > self.heartbeat_timeout_ms {
                session.closed = true;
                session.close_reason = Some(FailureReason::Timeout);
                warn!(
                    "Session {} for peer {} expired (no heartbeat)",
                    session.session_id, session.peer_id
                );
                expired.push(session.session_id.clone());
            }
        }
        expired
    }

    /// Close a session. Returns true when this call performed the close;
    /// closing an already-closed or unknown session is a no-op returning
    /// false, so duplicate close commands never propagate downstream.
    pub fn close(&self, session_id: &SessionId, reason: FailureReason) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_id) {
            Some(session) if !session.closed => {
                session.closed = true;
                session.close_reason = Some(reason);
                info!("Session {} closed ({})", session_id, reason);
                true
            }
            Some(_) => {
                debug!("Session {} already closed", session_id);
                false
            }
            None => false,
        }
    }

    /// Snapshot copy of one session
    pub fn session(&self, session_id: &SessionId) -> Option<ActiveSession> {
        self.sessions.read().get(session_id).cloned()
    }

    /// The live (unclosed) session for a peer, if any
    pub fn session_for_peer(&self, peer_id: &PeerId) -> Option<ActiveSession> {
        let by_peer = self.by_peer.read();
        let sessions = self.sessions.read();
        by_peer
            .get(peer_id)
            .and_then(|id| sessions.get(id))
            .filter(|s| !s.closed)
            .cloned()
    }

    /// Snapshot copies of every session, closed ones included
    pub fn sessions(&self) -> Vec<ActiveSession> {
        self.sessions.read().values().cloned().collect()
    }

    /// Count of live sessions
    pub fn active_count(&self) -> usize {
        self.sessions.read().values().filter(|s| !s.closed).count()
    }
}
