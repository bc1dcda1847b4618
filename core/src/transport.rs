//! Transport kinds and capabilities.
//!
//! A transport is a wireless technology with its own platform adapter. The
//! engine only sees the kind and an immutable capability record; everything
//! else (framing, OS APIs) stays behind the adapter contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transports the engine can negotiate over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bluetooth Low Energy
    BLE,
    /// Wi-Fi Direct (peer-to-peer)
    WiFiDirect,
    /// WiFi Aware (neighbor awareness networking)
    WiFiAware,
    /// In-process transport for testing and demos
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::BLE => write!(f, "BLE"),
            TransportKind::WiFiDirect => write!(f, "WiFiDirect"),
            TransportKind::WiFiAware => write!(f, "WiFiAware"),
            TransportKind::Local => write!(f, "Local"),
        }
    }
}

/// Capabilities of a transport. Immutable once registered with the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportCapability {
    /// Which transport this describes
    pub kind: TransportKind,
    /// Rough upper bound on throughput in bits per second
    pub max_throughput_bps: u64,
    /// Whether the adapter can broadcast our identity
    pub supports_advertise: bool,
    /// Whether the adapter can scan for peer advertisements
    pub supports_scan: bool,
}

impl TransportCapability {
    pub fn new(
        kind: TransportKind,
        max_throughput_bps: u64,
        supports_advertise: bool,
        supports_scan: bool,
    ) -> Self {
        Self {
            kind,
            max_throughput_bps,
            supports_advertise,
            supports_scan,
        }
    }

    /// Default capability record for a transport kind
    pub fn for_kind(kind: TransportKind) -> Self {
        match kind {
            TransportKind::BLE => Self {
                kind,
                max_throughput_bps: 2_000_000, // 2 Mbps
                supports_advertise: true,
                supports_scan: true,
            },
            TransportKind::WiFiDirect => Self {
                kind,
                max_throughput_bps: 250_000_000, // 250 Mbps
                supports_advertise: true,
                supports_scan: true,
            },
            TransportKind::WiFiAware => Self {
                kind,
                max_throughput_bps: 80_000_000, // 80 Mbps
                supports_advertise: true,
                supports_scan: true,
            },
            TransportKind::Local => Self {
                kind,
                max_throughput_bps: 10_000_000_000, // 10 Gbps
                supports_advertise: true,
                supports_scan: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::BLE.to_string(), "BLE");
        assert_eq!(TransportKind::WiFiDirect.to_string(), "WiFiDirect");
        assert_eq!(TransportKind::WiFiAware.to_string(), "WiFiAware");
        assert_eq!(TransportKind::Local.to_string(), "Local");
    }

    #[test]
    fn test_transport_kind_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(TransportKind::BLE);
        set.insert(TransportKind::WiFiDirect);
        set.insert(TransportKind::BLE);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_capability_defaults() {
        let ble = TransportCapability::for_kind(TransportKind::BLE);
        assert_eq!(ble.max_throughput_bps, 2_000_000);
        assert!(ble.supports_advertise);
        assert!(ble.supports_scan);

        let wifi = TransportCapability::for_kind(TransportKind::WiFiDirect);
        assert!(wifi.max_throughput_bps > ble.max_throughput_bps);
    }

    #[test]
    fn test_capability_serialization() {
        let cap = TransportCapability::for_kind(TransportKind::WiFiAware);
        let json = serde_json::to_string(&cap).expect("serialize");
        let back: TransportCapability = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind, TransportKind::WiFiAware);
        assert_eq!(back.max_throughput_bps, cap.max_throughput_bps);
    }
}
