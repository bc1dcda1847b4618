//! Discovery Registry.
//!
//! Deduplicates and tracks peer advertisements across transports. The registry
//! owns the peer map; everything else reads snapshot copies. Advertisements
//! never fail the caller: malformed input is dropped and counted.

use crate::negotiator::NegotiationState;
use crate::transport::TransportKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Stable peer identifier, derived from transport addresses by a [`PeerResolver`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Last sighting of a peer on one transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSighting {
    pub raw_address: String,
    /// Normalized signal quality in [0.0, 1.0]
    pub signal_hint: f64,
    pub last_seen_ms: u64,
}

/// Everything known about a discovered peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// A peer may be reachable via several transports at once
    pub transports: HashMap<TransportKind, TransportSighting>,
    pub negotiation_state: NegotiationState,
}

impl PeerRecord {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            transports: HashMap::new(),
            negotiation_state: NegotiationState::Idle,
        }
    }

    /// Most recent sighting timestamp across all transports
    pub fn last_seen_ms(&self) -> u64 {
        self.transports
            .values()
            .map(|s| s.last_seen_ms)
            .max()
            .unwrap_or(0)
    }
}

/// Resolves a per-transport address to a stable peer identity.
///
/// Cross-transport correlation needs out-of-band knowledge (an advertised
/// service id, for instance), so the strategy is pluggable. Returning `None`
/// drops the advertisement as unresolvable.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, kind: TransportKind, raw_address: &str) -> Option<PeerId>;
}

/// Default resolver: every transport address is its own peer.
pub struct TransportScopedResolver;

impl PeerResolver for TransportScopedResolver {
    fn resolve(&self, kind: TransportKind, raw_address: &str) -> Option<PeerId> {
        Some(PeerId(format!("{}/{}", kind, raw_address)))
    }
}

/// Correlates peers that advertise the same service identity.
///
/// Addresses of the form `service-id@transport-address` resolve to the
/// service id regardless of transport; anything else falls back to
/// transport-scoped identity.
pub struct ServiceNameResolver;

impl PeerResolver for ServiceNameResolver {
    fn resolve(&self, kind: TransportKind, raw_address: &str) -> Option<PeerId> {
        match raw_address.split_once('@') {
            Some((service, _)) if !service.is_empty() => Some(PeerId(service.to_string())),
            _ => TransportScopedResolver.resolve(kind, raw_address),
        }
    }
}

/// Tracks discovered peers across all transports
pub struct DiscoveryRegistry {
    peers: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
    resolver: Box<dyn PeerResolver>,
    silence_timeout_ms: u64,
    malformed: AtomicU64,
}

impl DiscoveryRegistry {
    pub fn new(resolver: Box<dyn PeerResolver>, silence_timeout_ms: u64) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            resolver,
            silence_timeout_ms,
            malformed: AtomicU64::new(0),
        }
    }

    /// Upsert a peer record from a raw advertisement.
    ///
    /// Sightings for the same resolved peer merge into one record. Malformed
    /// input (empty address, signal outside [0, 1]) is dropped and counted;
    /// this method never errors.
    pub fn on_advertisement(
        &self,
        kind: TransportKind,
        raw_address: &str,
        signal_hint: f64,
        now_ms: u64,
    ) -> Option<PeerRecord> {
        if raw_address.trim().is_empty()
            || !signal_hint.is_finite()
            || !(0.0..=1.0).contains(&signal_hint)
        {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dropping malformed advertisement on {}: addr={:?} signal={}",
                kind, raw_address, signal_hint
            );
            return None;
        }

        let peer_id = match self.resolver.resolve(kind, raw_address) {
            Some(id) => id,
            None => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let mut peers = self.peers.write();
        let record = peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerRecord::new(peer_id.clone()));
        record.transports.insert(
            kind,
            TransportSighting {
                raw_address: raw_address.to_string(),
                signal_hint,
                last_seen_ms: now_ms,
            },
        );
        debug!("Peer {} seen on {} (signal {:.2})", peer_id, kind, signal_hint);
        Some(record.clone())
    }

    /// Remove peers unseen on every transport beyond the silence timeout.
    /// Best effort; returns the pruned ids.
    pub fn prune(&self, now_ms: u64) -> Vec<PeerId> {
        let mut peers = self.peers.write();
        let mut removed = Vec::new();
        peers.retain(|peer_id, record| {
            let alive = record
                .transports
                .values()
                .any(|s| now_ms.saturating_sub(s.last_seen_ms) <= self.silence_timeout_ms);
            if !alive {
                removed.push(peer_id.clone());
            }
            alive
        });
        if !removed.is_empty() {
            info!("Pruned {} silent peer(s)", removed.len());
        }
        removed
    }

    /// Transports with a sighting inside the silence window, with signal hints
    pub fn recent_transports(&self, peer_id: &PeerId, now_ms: u64) -> Vec<(TransportKind, f64)> {
        let peers = self.peers.read();
        peers
            .get(peer_id)
            .map(|record| {
                record
                    .transports
                    .iter()
                    .filter(|(_, s)| {
                        now_ms.saturating_sub(s.last_seen_ms) <= self.silence_timeout_ms
                    })
                    .map(|(kind, s)| (*kind, s.signal_hint))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Raw address this peer last advertised on the given transport
    pub fn raw_address_for(&self, peer_id: &PeerId, kind: TransportKind) -> Option<String> {
        let peers = self.peers.read();
        peers
            .get(peer_id)
            .and_then(|record| record.transports.get(&kind))
            .map(|s| s.raw_address.clone())
    }

    /// Snapshot copy of one record
    pub fn snapshot(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Snapshot copies of every record
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Mirror of the negotiator's per-peer state, kept on the record
    pub fn set_negotiation_state(&self, peer_id: &PeerId, state: NegotiationState) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.negotiation_state = state;
        }
    }

    /// Advertisements dropped as malformed or unresolvable
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}
