//! Transport adapter capability contract.
//!
//! Platform-specific code (BLE watchers, Wi-Fi Direct advertisers, ...)
//! implements [`TransportAdapter`] and delivers completions asynchronously as
//! [`AdapterEvent`]s on the engine's event channel. The core never retries
//! adapter failures itself; errors here are surfaced to the caller.

pub mod loopback;

use crate::transport::TransportKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by platform adapters
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum AdapterError {
    #[error("Transport hardware unavailable")]
    Unavailable,

    #[error("Permission denied by the OS")]
    PermissionDenied,

    #[error("Operation already started")]
    AlreadyStarted,

    #[error("Adapter not initialized")]
    NotInitialized,

    #[error("Channel operation failed: {0}")]
    ChannelFailed(String),

    #[error("Adapter error: {0}")]
    Other(String),
}

/// Opaque handle to a transport-level channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Quality-of-service hint for channel opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosHint {
    LowLatency,
    HighBandwidth,
    LowPower,
    Balanced,
}

impl Default for QosHint {
    fn default() -> Self {
        QosHint::Balanced
    }
}

/// Parameters for opening a channel to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelParams {
    pub qos: QosHint,
    /// Largest payload the caller intends to send on this channel
    pub max_payload_size: usize,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            qos: QosHint::Balanced,
            max_payload_size: 4096,
        }
    }
}

/// Events delivered asynchronously by adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdapterEvent {
    /// A peer advertisement was observed during a scan
    Advertisement {
        address: String,
        /// Normalized signal quality in [0.0, 1.0]
        signal_hint: f64,
        timestamp_ms: u64,
    },
    /// A previously requested channel open completed
    ChannelOpened {
        handle: ChannelHandle,
        peer_address: String,
    },
    /// A channel failed; fatal for anything running on it
    ChannelError {
        handle: ChannelHandle,
        reason: String,
    },
    /// A channel was closed (locally or by the peer)
    ChannelClosed { handle: ChannelHandle },
}

impl fmt::Display for AdapterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterEvent::Advertisement {
                address,
                signal_hint,
                ..
            } => write!(
                f,
                "Advertisement {{ address: {}, signal: {:.2} }}",
                address, signal_hint
            ),
            AdapterEvent::ChannelOpened { handle, peer_address } => {
                write!(f, "ChannelOpened {{ {}, peer: {} }}", handle, peer_address)
            }
            AdapterEvent::ChannelError { handle, reason } => {
                write!(f, "ChannelError {{ {}, reason: {} }}", handle, reason)
            }
            AdapterEvent::ChannelClosed { handle } => {
                write!(f, "ChannelClosed {{ {} }}", handle)
            }
        }
    }
}

/// Channel adapters use to push events into the engine, tagged with their kind
pub type AdapterEventSender = mpsc::UnboundedSender<(TransportKind, AdapterEvent)>;

/// Platform adapter contract.
///
/// One implementation per transport kind, selected at startup via
/// configuration. Adapters own their OS handles (watchers, sockets) with an
/// explicit start/stop lifecycle; the engine releases them on shutdown.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Which transport this adapter drives
    fn kind(&self) -> TransportKind;

    /// Acquire OS resources. Must be called before any other operation.
    async fn initialize(&self) -> Result<(), AdapterError>;

    /// Release OS resources. Idempotent.
    async fn shutdown(&self) -> Result<(), AdapterError>;

    /// Begin scanning; advertisements arrive as [`AdapterEvent::Advertisement`]
    async fn start_scan(&self) -> Result<(), AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    /// Begin broadcasting the given identity to nearby devices
    async fn start_advertise(&self, identity: &str) -> Result<(), AdapterError>;

    async fn stop_advertise(&self) -> Result<(), AdapterError>;

    /// Request a channel to a peer address. The returned handle identifies the
    /// attempt; completion (or failure) is delivered as an event.
    async fn open_channel(
        &self,
        peer_address: &str,
        params: ChannelParams,
    ) -> Result<ChannelHandle, AdapterError>;

    async fn send_on_channel(&self, handle: ChannelHandle, bytes: &[u8])
        -> Result<(), AdapterError>;

    /// Close a channel. Closing an unknown or already-closed handle is a no-op.
    async fn close_channel(&self, handle: ChannelHandle);

    /// Invoked by the dispatcher after a fatal transport failure during an
    /// established session. The adapter decides whether and how to recover.
    async fn recover(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
