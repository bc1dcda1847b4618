// SoftMesh Core: cross-transport discovery and session negotiation
//
// Platform adapters (BLE, Wi-Fi Direct, ...) feed advertisement and channel
// events into the engine; the engine deduplicates peers across transports,
// negotiates the best link for each peer, and owns the resulting sessions.

pub mod adapter;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod negotiator;
pub mod registry;
pub mod session;
pub mod transport;

pub use adapter::{
    AdapterError, AdapterEvent, ChannelHandle, ChannelParams, QosHint, TransportAdapter,
};
pub use config::EngineConfig;
pub use dispatcher::{DispatchError, Dispatcher};
pub use engine::{start_engine, EngineCommand, EngineEvent, EngineHandle};
pub use negotiator::{
    FailureReason, LinkNegotiator, NegotiationError, NegotiationSession, NegotiationState,
    TransportCandidate,
};
pub use registry::{
    DiscoveryRegistry, PeerId, PeerRecord, PeerResolver, ServiceNameResolver, TransportScopedResolver,
    TransportSighting,
};
pub use session::{ActiveSession, ChannelStats, SessionError, SessionId, SessionManager};
pub use transport::{TransportCapability, TransportKind};

/// Milliseconds since the unix epoch. Events are stamped once, at the engine
/// boundary, so all staleness math stays deterministic under test.
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
