//! The engine task: one tokio loop that owns every moving part.
//!
//! Adapters push `(TransportKind, AdapterEvent)` pairs into the loop, callers
//! talk to it through an [`EngineHandle`], and a periodic tick drives peer
//! pruning, handshake timeouts and session sweeps. All mutation happens on
//! this task; handles only ever see snapshot copies.

use crate::adapter::{AdapterEvent, ChannelHandle, ChannelParams};
use crate::config::EngineConfig;
use crate::current_timestamp_ms;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::negotiator::{
    FailureReason, LinkNegotiator, NegotiationSession, NegotiationState, TransportCandidate,
};
use crate::registry::{DiscoveryRegistry, PeerId, PeerRecord};
use crate::session::{ActiveSession, SessionId, SessionManager};
use crate::transport::TransportKind;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Commands accepted by the engine task
#[derive(Debug)]
pub enum EngineCommand {
    /// Negotiate a link to a discovered peer
    Negotiate {
        peer_id: PeerId,
        reply: mpsc::Sender<Result<NegotiationSession, String>>,
    },
    /// Refresh a session's heartbeat
    Heartbeat {
        session_id: SessionId,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Send bytes on an established session's channel
    Send {
        session_id: SessionId,
        bytes: Vec<u8>,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Close a session; true when this call performed the close
    CloseSession {
        session_id: SessionId,
        reply: mpsc::Sender<bool>,
    },
    /// Snapshot of every discovered peer
    ListPeers { reply: mpsc::Sender<Vec<PeerRecord>> },
    /// Snapshot of every session, closed ones included
    ListSessions {
        reply: mpsc::Sender<Vec<ActiveSession>>,
    },
    StartDiscovery {
        reply: mpsc::Sender<Result<(), String>>,
    },
    StopDiscovery,
    StartAdvertising {
        identity: String,
        reply: mpsc::Sender<Result<(), String>>,
    },
    StopAdvertising,
    /// Tear everything down and stop the task
    Shutdown,
}

/// Events emitted by the engine to the application layer
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A peer was seen for the first time
    PeerDiscovered(PeerRecord),
    /// A peer went silent on every transport and was pruned
    PeerExpired(PeerId),
    /// A negotiated link completed its handshake
    SessionEstablished(ActiveSession),
    /// An established session ended
    SessionClosed {
        session_id: SessionId,
        peer_id: PeerId,
        reason: FailureReason,
    },
    /// Negotiation retries were exhausted; no session will form
    NegotiationFailed {
        peer_id: PeerId,
        reason: FailureReason,
    },
}

/// Handle to communicate with the running engine task
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Negotiate a link to a discovered peer
    pub async fn negotiate(&self, peer_id: PeerId) -> Result<NegotiationSession> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::Negotiate {
                peer_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Refresh a session's heartbeat
    pub async fn heartbeat(&self, session_id: SessionId) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::Heartbeat {
                session_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Send bytes on an established session
    pub async fn send(&self, session_id: SessionId, bytes: Vec<u8>) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::Send {
                session_id,
                bytes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Close a session. Ok(true) when this call performed the close.
    pub async fn close_session(&self, session_id: SessionId) -> Result<bool> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::CloseSession {
                session_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))
    }

    /// Snapshot of every discovered peer
    pub async fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::ListPeers { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))
    }

    /// Snapshot of every session, closed ones included
    pub async fn list_sessions(&self) -> Result<Vec<ActiveSession>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::ListSessions { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))
    }

    /// Start scanning on every scan-capable adapter
    pub async fn start_discovery(&self) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::StartDiscovery { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn stop_discovery(&self) -> Result<()> {
        self.command_tx
            .send(EngineCommand::StopDiscovery)
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))
    }

    /// Advertise the given identity on every advertise-capable adapter
    pub async fn start_advertising(&self, identity: String) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::StartAdvertising {
                identity,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.command_tx
            .send(EngineCommand::StopAdvertising)
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))
    }

    /// Shut the engine down
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))
    }
}

/// Everything the engine task owns
struct EngineState {
    registry: Arc<DiscoveryRegistry>,
    dispatcher: Arc<Dispatcher>,
    negotiator: LinkNegotiator,
    sessions: SessionManager,
    event_tx: mpsc::Sender<EngineEvent>,
    /// Channel opens awaiting a handshake ack, keyed by transport and handle
    pending_opens: HashMap<(TransportKind, ChannelHandle), PeerId>,
    /// Channels backing established sessions
    channel_index: HashMap<(TransportKind, ChannelHandle), SessionId>,
}

/// Spawn the engine task and return a handle to it.
///
/// `adapter_events` is the receiving end of the channel every registered
/// adapter was constructed with; `event_tx` carries engine events to the
/// application.
pub fn start_engine(
    config: EngineConfig,
    registry: Arc<DiscoveryRegistry>,
    dispatcher: Arc<Dispatcher>,
    mut adapter_events: mpsc::UnboundedReceiver<(TransportKind, AdapterEvent)>,
    event_tx: mpsc::Sender<EngineEvent>,
) -> EngineHandle {
    let (command_tx, mut command_rx) = mpsc::channel::<EngineCommand>(256);
    let handle = EngineHandle {
        command_tx: command_tx.clone(),
    };

    let negotiator = LinkNegotiator::new(config.clone());
    for capability in dispatcher.capabilities() {
        negotiator.set_capability(capability);
    }
    let sessions = SessionManager::new(config.heartbeat_timeout_ms);
    let tick_interval = Duration::from_millis(config.tick_interval_ms);

    let mut state = EngineState {
        registry,
        dispatcher,
        negotiator,
        sessions,
        event_tx,
        pending_opens: HashMap::new(),
        channel_index: HashMap::new(),
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Engine task started");

        loop {
            tokio::select! {
                Some((kind, event)) = adapter_events.recv() => {
                    state.handle_adapter_event(kind, event).await;
                }
                Some(command) = command_rx.recv() => {
                    if !state.handle_command(command).await {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    state.tick().await;
                }
            }
        }
        info!("Engine task stopped");
    });

    handle
}

impl EngineState {
    async fn handle_adapter_event(&mut self, kind: TransportKind, event: AdapterEvent) {
        match event {
            AdapterEvent::Advertisement {
                address,
                signal_hint,
                timestamp_ms,
            } => {
                self.on_advertisement(kind, &address, signal_hint, timestamp_ms)
                    .await;
            }
            AdapterEvent::ChannelOpened {
                handle,
                peer_address,
            } => {
                self.on_channel_opened(kind, handle, &peer_address).await;
            }
            AdapterEvent::ChannelError { handle, reason } => {
                self.on_channel_failed(kind, handle, &reason).await;
            }
            AdapterEvent::ChannelClosed { handle } => {
                self.on_channel_closed(kind, handle).await;
            }
        }
    }

    async fn on_advertisement(
        &mut self,
        kind: TransportKind,
        address: &str,
        signal_hint: f64,
        timestamp_ms: u64,
    ) {
        let record = match self
            .registry
            .on_advertisement(kind, address, signal_hint, timestamp_ms)
        {
            Some(record) => record,
            None => return,
        };

        let peer_id = record.peer_id.clone();
        if self.negotiator.peer_seen(&peer_id, timestamp_ms) {
            self.registry
                .set_negotiation_state(&peer_id, NegotiationState::Discovering);
            let _ = self
                .event_tx
                .send(EngineEvent::PeerDiscovered(record))
                .await;
        }

        // Negotiation starts as soon as a peer is reachable; repeat sightings
        // of an in-flight or established peer fall through as no-ops.
        if let Err(e) = self.try_negotiate(&peer_id, timestamp_ms).await {
            debug!("Auto-negotiation for {} not started: {}", peer_id, e);
        }
    }

    /// Select a transport and fire the channel open that serves as handshake.
    /// Idempotent while a negotiation is in flight or a session is live.
    async fn try_negotiate(
        &mut self,
        peer_id: &PeerId,
        now_ms: u64,
    ) -> Result<NegotiationSession, String> {
        if let Some(existing) = self.negotiator.session(peer_id) {
            match existing.state {
                NegotiationState::Negotiating
                | NegotiationState::Established
                | NegotiationState::Closing
                | NegotiationState::Closed => return Ok(existing),
                NegotiationState::Idle | NegotiationState::Discovering => {}
            }
        }

        let candidates: Vec<TransportCandidate> = self
            .registry
            .recent_transports(peer_id, now_ms)
            .into_iter()
            .map(|(kind, signal_hint)| TransportCandidate { kind, signal_hint })
            .collect();

        let session = self
            .negotiator
            .negotiate(peer_id, &candidates, now_ms)
            .map_err(|e| e.to_string())?;

        if session.state == NegotiationState::Negotiating {
            self.registry
                .set_negotiation_state(peer_id, NegotiationState::Negotiating);
            if let Some(kind) = session.chosen_transport {
                match self
                    .dispatcher
                    .open_channel_to_peer(peer_id, kind, ChannelParams::default())
                    .await
                {
                    Ok(handle) => {
                        self.pending_opens.insert((kind, handle), peer_id.clone());
                    }
                    Err(e) => {
                        // The handshake deadline will fire and drive the retry
                        warn!("Channel open to {} via {} failed: {}", peer_id, kind, e);
                    }
                }
            }
        }
        Ok(session)
    }

    /// A completed channel open is the handshake ack
    async fn on_channel_opened(
        &mut self,
        kind: TransportKind,
        handle: ChannelHandle,
        peer_address: &str,
    ) {
        let peer_id = match self.pending_opens.remove(&(kind, handle)) {
            Some(peer_id) => peer_id,
            None => {
                debug!(
                    "Unsolicited ChannelOpened {} from {} on {}, ignoring",
                    handle, peer_address, kind
                );
                return;
            }
        };

        let now_ms = current_timestamp_ms();
        let negotiation = match self.negotiator.handshake_acked(&peer_id, now_ms) {
            Ok(negotiation) => negotiation,
            Err(e) => {
                // The negotiation moved on (timed out and retried, or closed)
                // while this open was in flight; the channel is stale.
                debug!("Stale handshake ack for {}: {}", peer_id, e);
                let _ = self.dispatcher.close_channel(kind, handle).await;
                return;
            }
        };

        match self.sessions.register(&negotiation, handle, now_ms) {
            Ok(session) => {
                self.registry
                    .set_negotiation_state(&peer_id, NegotiationState::Established);
                self.channel_index
                    .insert((kind, handle), session.session_id.clone());
                let _ = self
                    .event_tx
                    .send(EngineEvent::SessionEstablished(session))
                    .await;
            }
            Err(e) => warn!("Session registration for {} failed: {}", peer_id, e),
        }
    }

    async fn on_channel_failed(&mut self, kind: TransportKind, handle: ChannelHandle, reason: &str) {
        if let Some(session_id) = self.channel_index.remove(&(kind, handle)) {
            warn!("Channel {} on {} failed: {}", handle, kind, reason);
            self.end_session(&session_id, FailureReason::TransportFailure, false)
                .await;
            // Fatal failure on a live link: give the adapter a chance to reset
            if let Err(e) = self.dispatcher.request_recovery(kind).await {
                warn!("Recovery request for {} failed: {}", kind, e);
            }
            return;
        }
        if self.pending_opens.remove(&(kind, handle)).is_some() {
            // Failed before the handshake completed; the negotiation deadline
            // expires it and re-selection excludes this transport.
            debug!("Pending open {} on {} failed: {}", handle, kind, reason);
        }
    }

    async fn on_channel_closed(&mut self, kind: TransportKind, handle: ChannelHandle) {
        self.pending_opens.remove(&(kind, handle));
        if let Some(session_id) = self.channel_index.remove(&(kind, handle)) {
            self.end_session(&session_id, FailureReason::Shutdown, false)
                .await;
        }
    }

    /// Close a session everywhere: manager, negotiator, registry mirror, and
    /// (optionally) the transport channel. Emits SessionClosed exactly once.
    async fn end_session(
        &mut self,
        session_id: &SessionId,
        reason: FailureReason,
        close_channel: bool,
    ) -> bool {
        let snapshot = match self.sessions.session(session_id) {
            Some(snapshot) => snapshot,
            None => return false,
        };
        if !self.sessions.close(session_id, reason) {
            return false;
        }

        self.channel_index
            .remove(&(snapshot.transport, snapshot.channel));
        if close_channel {
            let _ = self
                .dispatcher
                .close_channel(snapshot.transport, snapshot.channel)
                .await;
        }
        self.negotiator.close(&snapshot.peer_id, reason);
        self.registry
            .set_negotiation_state(&snapshot.peer_id, NegotiationState::Closed);
        let _ = self
            .event_tx
            .send(EngineEvent::SessionClosed {
                session_id: session_id.clone(),
                peer_id: snapshot.peer_id,
                reason,
            })
            .await;
        true
    }

    /// Returns false when the engine should stop
    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Negotiate { peer_id, reply } => {
                let result = self.try_negotiate(&peer_id, current_timestamp_ms()).await;
                let _ = reply.send(result).await;
            }
            EngineCommand::Heartbeat { session_id, reply } => {
                let result = self
                    .sessions
                    .heartbeat(&session_id, current_timestamp_ms())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result).await;
            }
            EngineCommand::Send {
                session_id,
                bytes,
                reply,
            } => {
                let result = self.send_on_session(&session_id, &bytes).await;
                let _ = reply.send(result).await;
            }
            EngineCommand::CloseSession { session_id, reply } => {
                let closed = self
                    .end_session(&session_id, FailureReason::Shutdown, true)
                    .await;
                let _ = reply.send(closed).await;
            }
            EngineCommand::ListPeers { reply } => {
                let _ = reply.send(self.registry.peers()).await;
            }
            EngineCommand::ListSessions { reply } => {
                let _ = reply.send(self.sessions.sessions()).await;
            }
            EngineCommand::StartDiscovery { reply } => {
                let result = self
                    .dispatcher
                    .start_discovery()
                    .await
                    .map_err(|e| e.to_string());
                let _ = reply.send(result).await;
            }
            EngineCommand::StopDiscovery => {
                self.dispatcher.stop_discovery().await;
            }
            EngineCommand::StartAdvertising { identity, reply } => {
                let result = self
                    .dispatcher
                    .start_advertising(&identity)
                    .await
                    .map_err(|e| e.to_string());
                let _ = reply.send(result).await;
            }
            EngineCommand::StopAdvertising => {
                self.dispatcher.stop_advertising().await;
            }
            EngineCommand::Shutdown => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    async fn send_on_session(&mut self, session_id: &SessionId, bytes: &[u8]) -> Result<(), String> {
        let session = self
            .sessions
            .session(session_id)
            .filter(|s| !s.closed)
            .ok_or_else(|| format!("No live session {}", session_id))?;

        match self
            .dispatcher
            .send_to_peer(&session.peer_id, session.transport, session.channel, bytes)
            .await
        {
            Ok(()) => self
                .sessions
                .record_traffic(session_id, bytes.len() as u64, 0)
                .map_err(|e| e.to_string()),
            Err(DispatchError::Adapter(e)) => {
                // A failed send on a live link is fatal for the session, same
                // as an asynchronous ChannelError from the adapter.
                warn!("Send on session {} failed: {}", session_id, e);
                self.end_session(session_id, FailureReason::TransportFailure, false)
                    .await;
                if let Err(re) = self.dispatcher.request_recovery(session.transport).await {
                    warn!("Recovery request for {} failed: {}", session.transport, re);
                }
                Err(e.to_string())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn tick(&mut self) {
        let now_ms = current_timestamp_ms();

        // A live session keeps its peer's discovery record warm: pruning the
        // record would orphan the session's addressing info.
        for session in self.sessions.sessions() {
            if session.closed {
                continue;
            }
            if let Some(record) = self.registry.snapshot(&session.peer_id) {
                if let Some(sighting) = record.transports.get(&session.transport) {
                    self.registry.on_advertisement(
                        session.transport,
                        &sighting.raw_address,
                        sighting.signal_hint,
                        now_ms,
                    );
                }
            }
        }

        for peer_id in self.registry.prune(now_ms) {
            self.negotiator.cleanup_peer(&peer_id);
            let _ = self.event_tx.send(EngineEvent::PeerExpired(peer_id)).await;
        }

        for timed_out in self.negotiator.check_timeouts(now_ms) {
            // Discard the open that never completed
            if let Some(kind) = timed_out.failed_transport {
                let stale: Vec<ChannelHandle> = self
                    .pending_opens
                    .iter()
                    .filter(|((k, _), p)| *k == kind && **p == timed_out.peer_id)
                    .map(|((_, h), _)| *h)
                    .collect();
                for handle in stale {
                    self.pending_opens.remove(&(kind, handle));
                    let _ = self.dispatcher.close_channel(kind, handle).await;
                }
            }

            if timed_out.exhausted {
                self.registry
                    .set_negotiation_state(&timed_out.peer_id, NegotiationState::Closed);
                let _ = self
                    .event_tx
                    .send(EngineEvent::NegotiationFailed {
                        peer_id: timed_out.peer_id,
                        reason: FailureReason::Timeout,
                    })
                    .await;
            } else {
                self.registry
                    .set_negotiation_state(&timed_out.peer_id, NegotiationState::Discovering);
                let peer_id = timed_out.peer_id.clone();
                if let Err(e) = self.try_negotiate(&peer_id, now_ms).await {
                    debug!("Retry negotiation for {} not started: {}", peer_id, e);
                }
            }
        }

        for session_id in self.sessions.sweep(now_ms) {
            if let Some(session) = self.sessions.session(&session_id) {
                self.channel_index
                    .remove(&(session.transport, session.channel));
                let _ = self
                    .dispatcher
                    .close_channel(session.transport, session.channel)
                    .await;
                self.negotiator.close(&session.peer_id, FailureReason::Timeout);
                self.registry
                    .set_negotiation_state(&session.peer_id, NegotiationState::Closed);
                let _ = self
                    .event_tx
                    .send(EngineEvent::SessionClosed {
                        session_id,
                        peer_id: session.peer_id,
                        reason: FailureReason::Timeout,
                    })
                    .await;
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Engine shutting down");
        let live: Vec<SessionId> = self
            .sessions
            .sessions()
            .into_iter()
            .filter(|s| !s.closed)
            .map(|s| s.session_id)
            .collect();
        for session_id in live {
            self.end_session(&session_id, FailureReason::Shutdown, true)
                .await;
        }
        self.dispatcher.stop_discovery().await;
        self.dispatcher.stop_advertising().await;
        self.dispatcher.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::loopback::LoopbackAdapter;
    use crate::adapter::TransportAdapter;
    use crate::registry::ServiceNameResolver;
    use crate::transport::TransportCapability;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::Receiver<EngineEvent>) -> EngineEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("engine event channel closed")
    }

    fn harness() -> (
        Arc<DiscoveryRegistry>,
        Arc<Dispatcher>,
        Arc<LoopbackAdapter>,
        EngineHandle,
        mpsc::Receiver<EngineEvent>,
    ) {
        let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);

        let registry = Arc::new(DiscoveryRegistry::new(Box::new(ServiceNameResolver), 30_000));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let adapter = Arc::new(LoopbackAdapter::new(TransportKind::Local, adapter_tx));
        dispatcher
            .register_adapter(
                TransportCapability::for_kind(TransportKind::Local),
                adapter.clone(),
            )
            .unwrap();

        let handle = start_engine(
            EngineConfig::default(),
            registry.clone(),
            dispatcher.clone(),
            adapter_rx,
            event_tx,
        );
        (registry, dispatcher, adapter, handle, event_rx)
    }

    #[tokio::test]
    async fn test_advertisement_to_established_session() {
        let (_registry, _dispatcher, adapter, handle, mut events) = harness();
        adapter.initialize().await.unwrap();

        adapter.inject_advertisement("P1@loop", 0.9, current_timestamp_ms());

        match next_event(&mut events).await {
            EngineEvent::PeerDiscovered(record) => {
                assert_eq!(record.peer_id, PeerId::from("P1"));
            }
            other => panic!("expected PeerDiscovered, got {:?}", other),
        }
        match next_event(&mut events).await {
            EngineEvent::SessionEstablished(session) => {
                assert_eq!(session.peer_id, PeerId::from("P1"));
                assert_eq!(session.transport, TransportKind::Local);
            }
            other => panic!("expected SessionEstablished, got {:?}", other),
        }

        let sessions = handle.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].closed);
    }

    #[tokio::test]
    async fn test_repeat_sightings_yield_one_session() {
        let (_registry, _dispatcher, adapter, handle, mut events) = harness();
        adapter.initialize().await.unwrap();

        let now = current_timestamp_ms();
        adapter.inject_advertisement("P1@loop", 0.9, now);
        adapter.inject_advertisement("P1@loop", 0.8, now + 1);
        adapter.inject_advertisement("P1@loop", 0.7, now + 2);

        let _ = next_event(&mut events).await; // PeerDiscovered
        let _ = next_event(&mut events).await; // SessionEstablished

        // Let the remaining sightings drain through the engine
        let peers = handle.list_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(handle.list_sessions().await.unwrap().len(), 1);
        assert_eq!(adapter.open_channels().len(), 1);
    }

    #[tokio::test]
    async fn test_send_and_heartbeat_on_session() {
        let (_registry, _dispatcher, adapter, handle, mut events) = harness();
        adapter.initialize().await.unwrap();
        adapter.inject_advertisement("P1@loop", 0.9, current_timestamp_ms());

        let _ = next_event(&mut events).await;
        let session = match next_event(&mut events).await {
            EngineEvent::SessionEstablished(session) => session,
            other => panic!("expected SessionEstablished, got {:?}", other),
        };

        handle
            .send(session.session_id.clone(), b"hello".to_vec())
            .await
            .unwrap();
        handle.heartbeat(session.session_id.clone()).await.unwrap();

        assert_eq!(adapter.sent_frames().len(), 1);
        let refreshed = handle
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.session_id == session.session_id)
            .unwrap();
        assert_eq!(refreshed.stats.bytes_sent, 5);
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent_downstream() {
        let (_registry, _dispatcher, adapter, handle, mut events) = harness();
        adapter.initialize().await.unwrap();
        adapter.inject_advertisement("P1@loop", 0.9, current_timestamp_ms());

        let _ = next_event(&mut events).await;
        let session = match next_event(&mut events).await {
            EngineEvent::SessionEstablished(session) => session,
            other => panic!("expected SessionEstablished, got {:?}", other),
        };

        assert!(handle.close_session(session.session_id.clone()).await.unwrap());
        match next_event(&mut events).await {
            EngineEvent::SessionClosed { reason, .. } => {
                assert_eq!(reason, FailureReason::Shutdown);
            }
            other => panic!("expected SessionClosed, got {:?}", other),
        }

        // Duplicate close: no second SessionClosed, no adapter call
        assert!(!handle.close_session(session.session_id).await.unwrap());
        assert!(adapter.open_channels().is_empty());
    }

    #[tokio::test]
    async fn test_channel_error_closes_session_and_requests_recovery() {
        let (_registry, _dispatcher, adapter, _handle, mut events) = harness();
        adapter.initialize().await.unwrap();
        adapter.inject_advertisement("P1@loop", 0.9, current_timestamp_ms());

        let _ = next_event(&mut events).await;
        let session = match next_event(&mut events).await {
            EngineEvent::SessionEstablished(session) => session,
            other => panic!("expected SessionEstablished, got {:?}", other),
        };

        adapter.fail_channel(session.channel, "radio off");
        match next_event(&mut events).await {
            EngineEvent::SessionClosed { reason, .. } => {
                assert_eq!(reason, FailureReason::TransportFailure);
            }
            other => panic!("expected SessionClosed, got {:?}", other),
        }
        assert_eq!(adapter.recover_calls(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_closes_session_and_requests_recovery() {
        let (_registry, _dispatcher, adapter, handle, mut events) = harness();
        adapter.initialize().await.unwrap();
        adapter.inject_advertisement("P1@loop", 0.9, current_timestamp_ms());

        let _ = next_event(&mut events).await;
        let session = match next_event(&mut events).await {
            EngineEvent::SessionEstablished(session) => session,
            other => panic!("expected SessionEstablished, got {:?}", other),
        };

        // Wipe the adapter's channel state so the next send fails
        // synchronously, with no ChannelError event to fall back on
        adapter.shutdown().await.unwrap();

        let err = handle
            .send(session.session_id.clone(), b"hi".to_vec())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ch-"));

        // The failed send closed the session and asked the adapter to recover
        match next_event(&mut events).await {
            EngineEvent::SessionClosed { reason, .. } => {
                assert_eq!(reason, FailureReason::TransportFailure);
            }
            other => panic!("expected SessionClosed, got {:?}", other),
        }
        let sessions = handle.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].closed);
        assert_eq!(sessions[0].close_reason, Some(FailureReason::TransportFailure));
        assert_eq!(adapter.recover_calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_advertisement_is_counted_not_fatal() {
        let (registry, _dispatcher, adapter, handle, mut events) = harness();
        adapter.initialize().await.unwrap();

        adapter.inject_advertisement("", 0.9, current_timestamp_ms());
        adapter.inject_advertisement("P1@loop", 2.5, current_timestamp_ms());
        adapter.inject_advertisement("P1@loop", 0.9, current_timestamp_ms());

        // Only the valid advertisement produces a peer
        match next_event(&mut events).await {
            EngineEvent::PeerDiscovered(record) => {
                assert_eq!(record.peer_id, PeerId::from("P1"));
            }
            other => panic!("expected PeerDiscovered, got {:?}", other),
        }
        assert_eq!(handle.list_peers().await.unwrap().len(), 1);
        assert_eq!(registry.malformed_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_adapters() {
        let (_registry, _dispatcher, adapter, handle, mut events) = harness();
        adapter.initialize().await.unwrap();
        adapter.start_scan().await.unwrap();
        adapter.inject_advertisement("P1@loop", 0.9, current_timestamp_ms());

        let _ = next_event(&mut events).await;
        let _ = next_event(&mut events).await;

        handle.shutdown().await.unwrap();
        match next_event(&mut events).await {
            EngineEvent::SessionClosed { reason, .. } => {
                assert_eq!(reason, FailureReason::Shutdown);
            }
            other => panic!("expected SessionClosed, got {:?}", other),
        }

        // The task is gone; further commands fail
        assert!(handle.list_peers().await.is_err());

        // Adapter teardown finishes after the close event; poll briefly
        for _ in 0..50 {
            if !adapter.is_scanning() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!adapter.is_scanning());
    }
}
