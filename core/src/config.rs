//! Engine configuration.

use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};

/// Tunables for discovery, negotiation and session upkeep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Peers unseen on every transport for this long are pruned
    pub silence_timeout_ms: u64,
    /// How long to wait for a handshake ack before retrying negotiation
    pub handshake_timeout_ms: u64,
    /// Negotiation retries (with transport re-selection) before permanent failure
    pub max_retries: u32,
    /// Sessions without a heartbeat for this long are swept
    pub heartbeat_timeout_ms: u64,
    /// Engine maintenance tick interval
    pub tick_interval_ms: u64,
    /// Weight of signal quality in the transport score
    pub signal_weight: f64,
    /// Weight of the throughput hint in the transport score
    pub throughput_weight: f64,
    /// Tie-break order when two transports score equally (earlier wins)
    pub transport_priority: Vec<TransportKind>,
    /// Merge sightings of the same advertised service across transports
    pub correlate_across_transports: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 30_000,
            handshake_timeout_ms: 5_000,
            max_retries: 3,
            heartbeat_timeout_ms: 15_000,
            tick_interval_ms: 1_000,
            signal_weight: 0.7,
            throughput_weight: 0.3,
            transport_priority: vec![
                TransportKind::WiFiDirect,
                TransportKind::WiFiAware,
                TransportKind::BLE,
                TransportKind::Local,
            ],
            correlate_across_transports: false,
        }
    }
}

impl EngineConfig {
    pub fn with_silence_timeout_ms(mut self, ms: u64) -> Self {
        self.silence_timeout_ms = ms;
        self
    }

    pub fn with_handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn with_transport_priority(mut self, priority: Vec<TransportKind>) -> Self {
        self.transport_priority = priority;
        self
    }

    pub fn with_correlation(mut self, enabled: bool) -> Self {
        self.correlate_across_transports = enabled;
        self
    }

    /// Position of a transport in the tie-break order; unlisted kinds sort last
    pub fn priority_index(&self, kind: TransportKind) -> usize {
        self.transport_priority
            .iter()
            .position(|&k| k == kind)
            .unwrap_or(usize::MAX)
    }
}
