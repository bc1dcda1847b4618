//! Dispatcher.
//!
//! Routes outbound commands to the adapter registered for a transport kind
//! and fans discovery/advertising control out across adapters. Capability
//! records are immutable once registered. Unknown transports and unknown
//! peers are hard errors, never silently dropped.

use crate::adapter::{AdapterError, ChannelHandle, ChannelParams, TransportAdapter};
use crate::registry::{DiscoveryRegistry, PeerId};
use crate::transport::{TransportCapability, TransportKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("No adapter registered for transport {0}")]
    UnknownTransport(TransportKind),

    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("Peer {0} has no known address on transport {1}")]
    NoAddressOnTransport(PeerId, TransportKind),

    #[error("Transport {0} already registered")]
    AlreadyRegistered(TransportKind),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Routes commands to transport adapters
pub struct Dispatcher {
    adapters: RwLock<HashMap<TransportKind, Arc<dyn TransportAdapter>>>,
    capabilities: RwLock<HashMap<TransportKind, TransportCapability>>,
    registry: Arc<DiscoveryRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<DiscoveryRegistry>) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            capabilities: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// Register an adapter with its capability record.
    ///
    /// Capabilities are immutable once registered; a second registration for
    /// the same kind is rejected.
    pub fn register_adapter(
        &self,
        capability: TransportCapability,
        adapter: Arc<dyn TransportAdapter>,
    ) -> Result<(), DispatchError> {
        let kind = capability.kind;
        // One lock at a time; the fan-out helpers hold capabilities and
        // adapters together, so nesting the writes here could deadlock.
        {
            let mut adapters = self.adapters.write();
            if adapters.contains_key(&kind) {
                return Err(DispatchError::AlreadyRegistered(kind));
            }
            adapters.insert(kind, adapter);
        }
        self.capabilities.write().insert(kind, capability);
        info!("Adapter registered for {}", kind);
        Ok(())
    }

    pub fn capability(&self, kind: TransportKind) -> Option<TransportCapability> {
        self.capabilities.read().get(&kind).cloned()
    }

    pub fn capabilities(&self) -> Vec<TransportCapability> {
        self.capabilities.read().values().cloned().collect()
    }

    pub fn registered_kinds(&self) -> Vec<TransportKind> {
        self.adapters.read().keys().copied().collect()
    }

    fn adapter(&self, kind: TransportKind) -> Result<Arc<dyn TransportAdapter>, DispatchError> {
        self.adapters
            .read()
            .get(&kind)
            .cloned()
            .ok_or(DispatchError::UnknownTransport(kind))
    }

    /// Initialize every registered adapter
    pub async fn initialize_all(&self) -> Result<(), DispatchError> {
        let adapters: Vec<_> = self.adapters.read().values().cloned().collect();
        for adapter in adapters {
            adapter.initialize().await?;
        }
        Ok(())
    }

    /// Shut every adapter down; best effort
    pub async fn shutdown_all(&self) {
        let adapters: Vec<_> = self.adapters.read().values().cloned().collect();
        for adapter in adapters {
            if let Err(e) = adapter.shutdown().await {
                warn!("Adapter {} shutdown failed: {}", adapter.kind(), e);
            }
        }
    }

    /// Start scanning on every adapter that supports it. All adapters are
    /// attempted; the first error (if any) is returned afterwards.
    pub async fn start_discovery(&self) -> Result<(), DispatchError> {
        let targets = self.scan_capable();
        let mut first_err = None;
        for adapter in targets {
            if let Err(e) = adapter.start_scan().await {
                warn!("start_scan failed on {}: {}", adapter.kind(), e);
                first_err.get_or_insert(DispatchError::Adapter(e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn stop_discovery(&self) {
        for adapter in self.scan_capable() {
            if let Err(e) = adapter.stop_scan().await {
                warn!("stop_scan failed on {}: {}", adapter.kind(), e);
            }
        }
    }

    /// Advertise our identity on every adapter that supports it
    pub async fn start_advertising(&self, identity: &str) -> Result<(), DispatchError> {
        let targets = self.advertise_capable();
        let mut first_err = None;
        for adapter in targets {
            if let Err(e) = adapter.start_advertise(identity).await {
                warn!("start_advertise failed on {}: {}", adapter.kind(), e);
                first_err.get_or_insert(DispatchError::Adapter(e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn stop_advertising(&self) {
        for adapter in self.advertise_capable() {
            if let Err(e) = adapter.stop_advertise().await {
                warn!("stop_advertise failed on {}: {}", adapter.kind(), e);
            }
        }
    }

    /// Open a channel to a raw transport address
    pub async fn open_channel(
        &self,
        kind: TransportKind,
        peer_address: &str,
        params: ChannelParams,
    ) -> Result<ChannelHandle, DispatchError> {
        let adapter = self.adapter(kind)?;
        let handle = adapter.open_channel(peer_address, params).await?;
        Ok(handle)
    }

    /// Open a channel to a discovered peer over the given transport,
    /// resolving the peer's raw address from the registry.
    pub async fn open_channel_to_peer(
        &self,
        peer_id: &PeerId,
        kind: TransportKind,
        params: ChannelParams,
    ) -> Result<ChannelHandle, DispatchError> {
        if self.registry.snapshot(peer_id).is_none() {
            return Err(DispatchError::UnknownPeer(peer_id.clone()));
        }
        let address = self
            .registry
            .raw_address_for(peer_id, kind)
            .ok_or_else(|| DispatchError::NoAddressOnTransport(peer_id.clone(), kind))?;
        let adapter = self.adapter(kind)?;
        let handle = adapter.open_channel(&address, params).await?;
        debug!("Opening channel {} to {} via {}", handle, peer_id, kind);
        Ok(handle)
    }

    /// Send bytes on an open channel belonging to the given peer
    pub async fn send_to_peer(
        &self,
        peer_id: &PeerId,
        kind: TransportKind,
        handle: ChannelHandle,
        bytes: &[u8],
    ) -> Result<(), DispatchError> {
        if self.registry.snapshot(peer_id).is_none() {
            return Err(DispatchError::UnknownPeer(peer_id.clone()));
        }
        let adapter = self.adapter(kind)?;
        adapter.send_on_channel(handle, bytes).await?;
        Ok(())
    }

    /// Close a transport channel
    pub async fn close_channel(
        &self,
        kind: TransportKind,
        handle: ChannelHandle,
    ) -> Result<(), DispatchError> {
        let adapter = self.adapter(kind)?;
        adapter.close_channel(handle).await;
        Ok(())
    }

    /// Forward a fatal transport failure to the adapter's recovery hook.
    /// The adapter decides what recovery means; the core never retries opens.
    pub async fn request_recovery(&self, kind: TransportKind) -> Result<(), DispatchError> {
        let adapter = self.adapter(kind)?;
        if let Err(e) = adapter.recover().await {
            warn!("Recovery on {} failed: {}", kind, e);
            return Err(DispatchError::Adapter(e));
        }
        Ok(())
    }

    fn scan_capable(&self) -> Vec<Arc<dyn TransportAdapter>> {
        let caps = self.capabilities.read();
        self.adapters
            .read()
            .iter()
            .filter(|(kind, _)| caps.get(kind).map(|c| c.supports_scan).unwrap_or(false))
            .map(|(_, a)| a.clone())
            .collect()
    }

    fn advertise_capable(&self) -> Vec<Arc<dyn TransportAdapter>> {
        let caps = self.capabilities.read();
        self.adapters
            .read()
            .iter()
            .filter(|(kind, _)| {
                caps.get(kind)
                    .map(|c| c.supports_advertise)
                    .unwrap_or(false)
            })
            .map(|(_, a)| a.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::loopback::LoopbackAdapter;
    use crate::registry::{ServiceNameResolver, TransportScopedResolver};
    use tokio::sync::mpsc;

    fn setup() -> (Arc<DiscoveryRegistry>, Dispatcher, Arc<LoopbackAdapter>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(DiscoveryRegistry::new(Box::new(ServiceNameResolver), 30_000));
        let dispatcher = Dispatcher::new(registry.clone());
        let adapter = Arc::new(LoopbackAdapter::new(TransportKind::Local, tx));
        dispatcher
            .register_adapter(
                TransportCapability::for_kind(TransportKind::Local),
                adapter.clone(),
            )
            .unwrap();
        (registry, dispatcher, adapter)
    }

    #[tokio::test]
    async fn test_register_twice_rejected() {
        let (_registry, dispatcher, adapter) = setup();
        let err = dispatcher
            .register_adapter(TransportCapability::for_kind(TransportKind::Local), adapter)
            .unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_unknown_transport() {
        let (_registry, dispatcher, _adapter) = setup();
        let err = dispatcher
            .close_channel(TransportKind::BLE, ChannelHandle(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTransport(TransportKind::BLE)));
    }

    #[tokio::test]
    async fn test_open_channel_unknown_peer() {
        let (_registry, dispatcher, _adapter) = setup();
        let err = dispatcher
            .open_channel_to_peer(
                &PeerId::from("ghost"),
                TransportKind::Local,
                ChannelParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_open_channel_by_raw_address() {
        let (_registry, dispatcher, adapter) = setup();
        adapter.initialize().await.unwrap();
        let handle = dispatcher
            .open_channel(TransportKind::Local, "raw-addr", ChannelParams::default())
            .await
            .unwrap();
        assert!(adapter.open_channels().contains(&handle));
    }

    #[tokio::test]
    async fn test_open_channel_resolves_address() {
        let (registry, dispatcher, adapter) = setup();
        adapter.initialize().await.unwrap();
        registry.on_advertisement(TransportKind::Local, "P1@loop-addr", 0.9, 0);

        let handle = dispatcher
            .open_channel_to_peer(
                &PeerId::from("P1"),
                TransportKind::Local,
                ChannelParams::default(),
            )
            .await
            .unwrap();
        assert!(adapter.open_channels().contains(&handle));
    }

    #[tokio::test]
    async fn test_open_channel_no_address_on_transport() {
        let (registry, dispatcher, _adapter) = setup();
        registry.on_advertisement(TransportKind::Local, "P1@loop-addr", 0.9, 0);

        let err = dispatcher
            .open_channel_to_peer(
                &PeerId::from("P1"),
                TransportKind::BLE,
                ChannelParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoAddressOnTransport(_, _)));
    }

    #[tokio::test]
    async fn test_send_to_peer_routes_bytes() {
        let (registry, dispatcher, adapter) = setup();
        adapter.initialize().await.unwrap();
        registry.on_advertisement(TransportKind::Local, "P1@loop-addr", 0.9, 0);

        let handle = dispatcher
            .open_channel_to_peer(
                &PeerId::from("P1"),
                TransportKind::Local,
                ChannelParams::default(),
            )
            .await
            .unwrap();
        dispatcher
            .send_to_peer(&PeerId::from("P1"), TransportKind::Local, handle, b"ping")
            .await
            .unwrap();
        assert_eq!(adapter.sent_frames(), vec![(handle, b"ping".to_vec())]);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (_registry, dispatcher, adapter) = setup();
        adapter.initialize().await.unwrap();
        let err = dispatcher
            .send_to_peer(
                &PeerId::from("ghost"),
                TransportKind::Local,
                ChannelHandle(1),
                b"ping",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_start_discovery_respects_scan_capability() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(DiscoveryRegistry::new(
            Box::new(TransportScopedResolver),
            30_000,
        ));
        let dispatcher = Dispatcher::new(registry);

        let scanner = Arc::new(LoopbackAdapter::new(TransportKind::Local, tx.clone()));
        let mute = Arc::new(LoopbackAdapter::new(TransportKind::BLE, tx));
        dispatcher
            .register_adapter(
                TransportCapability::for_kind(TransportKind::Local),
                scanner.clone(),
            )
            .unwrap();
        dispatcher
            .register_adapter(
                TransportCapability::new(TransportKind::BLE, 2_000_000, true, false),
                mute.clone(),
            )
            .unwrap();

        dispatcher.initialize_all().await.unwrap();
        dispatcher.start_discovery().await.unwrap();

        assert!(scanner.is_scanning());
        assert!(!mute.is_scanning());
    }

    #[tokio::test]
    async fn test_request_recovery_reaches_adapter() {
        let (_registry, dispatcher, adapter) = setup();
        dispatcher
            .request_recovery(TransportKind::Local)
            .await
            .unwrap();
        assert_eq!(adapter.recover_calls(), 1);
    }

    #[tokio::test]
    async fn test_advertising_fanout() {
        let (_registry, dispatcher, adapter) = setup();
        adapter.initialize().await.unwrap();
        dispatcher.start_advertising("node-1").await.unwrap();
        assert_eq!(adapter.advertised_identity().as_deref(), Some("node-1"));
        dispatcher.stop_advertising().await;
        assert!(adapter.advertised_identity().is_none());
    }
}
