//! In-process loopback adapter.
//!
//! Drives the engine without any radio hardware: tests and the demo binary
//! inject advertisements and control channel-open outcomes by hand. Plays the
//! role the `Local` transport plays in larger meshes.

use super::{
    AdapterError, AdapterEvent, AdapterEventSender, ChannelHandle, ChannelParams, TransportAdapter,
};
use crate::transport::TransportKind;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct LoopbackState {
    initialized: bool,
    scanning: bool,
    advertising: Option<String>,
    next_handle: u64,
    /// Opens awaiting an explicit confirm_open / fail_open
    pending_opens: HashMap<ChannelHandle, String>,
    /// Confirmed channels, handle -> peer address
    channels: HashMap<ChannelHandle, String>,
    /// Frames written via send_on_channel, kept for assertions
    sent: Vec<(ChannelHandle, Vec<u8>)>,
    recover_calls: u64,
}

/// Test/demo adapter that loops events straight back into the engine
pub struct LoopbackAdapter {
    kind: TransportKind,
    events: AdapterEventSender,
    /// When true, open_channel immediately emits ChannelOpened
    auto_confirm: bool,
    state: Arc<RwLock<LoopbackState>>,
}

impl LoopbackAdapter {
    pub fn new(kind: TransportKind, events: AdapterEventSender) -> Self {
        Self {
            kind,
            events,
            auto_confirm: true,
            state: Arc::new(RwLock::new(LoopbackState::default())),
        }
    }

    /// Leave channel opens pending until confirm_open / fail_open is called.
    /// Used to exercise handshake timeout paths.
    pub fn manual_confirm(kind: TransportKind, events: AdapterEventSender) -> Self {
        Self {
            kind,
            events,
            auto_confirm: false,
            state: Arc::new(RwLock::new(LoopbackState::default())),
        }
    }

    /// Simulate a peer advertisement arriving on this transport
    pub fn inject_advertisement(&self, address: &str, signal_hint: f64, timestamp_ms: u64) {
        let _ = self.events.send((
            self.kind,
            AdapterEvent::Advertisement {
                address: address.to_string(),
                signal_hint,
                timestamp_ms,
            },
        ));
    }

    /// Complete a pending channel open
    pub fn confirm_open(&self, handle: ChannelHandle) {
        let peer_address = {
            let mut state = self.state.write();
            match state.pending_opens.remove(&handle) {
                Some(addr) => {
                    state.channels.insert(handle, addr.clone());
                    addr
                }
                None => return,
            }
        };
        let _ = self.events.send((
            self.kind,
            AdapterEvent::ChannelOpened {
                handle,
                peer_address,
            },
        ));
    }

    /// Fail a channel (pending or confirmed) with the given reason
    pub fn fail_channel(&self, handle: ChannelHandle, reason: &str) {
        {
            let mut state = self.state.write();
            state.pending_opens.remove(&handle);
            state.channels.remove(&handle);
        }
        let _ = self.events.send((
            self.kind,
            AdapterEvent::ChannelError {
                handle,
                reason: reason.to_string(),
            },
        ));
    }

    pub fn is_scanning(&self) -> bool {
        self.state.read().scanning
    }

    pub fn advertised_identity(&self) -> Option<String> {
        self.state.read().advertising.clone()
    }

    pub fn pending_opens(&self) -> Vec<ChannelHandle> {
        self.state.read().pending_opens.keys().copied().collect()
    }

    pub fn open_channels(&self) -> Vec<ChannelHandle> {
        self.state.read().channels.keys().copied().collect()
    }

    pub fn sent_frames(&self) -> Vec<(ChannelHandle, Vec<u8>)> {
        self.state.read().sent.clone()
    }

    pub fn recover_calls(&self) -> u64 {
        self.state.read().recover_calls
    }
}

#[async_trait]
impl TransportAdapter for LoopbackAdapter {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        let mut state = self.state.write();
        state.initialized = true;
        debug!("Loopback adapter initialized for {}", self.kind);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), AdapterError> {
        let mut state = self.state.write();
        state.initialized = false;
        state.scanning = false;
        state.advertising = None;
        state.pending_opens.clear();
        state.channels.clear();
        Ok(())
    }

    async fn start_scan(&self) -> Result<(), AdapterError> {
        let mut state = self.state.write();
        if !state.initialized {
            return Err(AdapterError::NotInitialized);
        }
        if state.scanning {
            return Err(AdapterError::AlreadyStarted);
        }
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.state.write().scanning = false;
        Ok(())
    }

    async fn start_advertise(&self, identity: &str) -> Result<(), AdapterError> {
        let mut state = self.state.write();
        if !state.initialized {
            return Err(AdapterError::NotInitialized);
        }
        if state.advertising.is_some() {
            return Err(AdapterError::AlreadyStarted);
        }
        state.advertising = Some(identity.to_string());
        Ok(())
    }

    async fn stop_advertise(&self) -> Result<(), AdapterError> {
        self.state.write().advertising = None;
        Ok(())
    }

    async fn open_channel(
        &self,
        peer_address: &str,
        _params: ChannelParams,
    ) -> Result<ChannelHandle, AdapterError> {
        let (handle, confirm) = {
            let mut state = self.state.write();
            if !state.initialized {
                return Err(AdapterError::NotInitialized);
            }
            state.next_handle += 1;
            let handle = ChannelHandle(state.next_handle);
            if self.auto_confirm {
                state.channels.insert(handle, peer_address.to_string());
            } else {
                state.pending_opens.insert(handle, peer_address.to_string());
            }
            (handle, self.auto_confirm)
        };

        if confirm {
            let _ = self.events.send((
                self.kind,
                AdapterEvent::ChannelOpened {
                    handle,
                    peer_address: peer_address.to_string(),
                },
            ));
        }
        Ok(handle)
    }

    async fn send_on_channel(
        &self,
        handle: ChannelHandle,
        bytes: &[u8],
    ) -> Result<(), AdapterError> {
        let mut state = self.state.write();
        if !state.channels.contains_key(&handle) {
            return Err(AdapterError::ChannelFailed(format!(
                "unknown channel {}",
                handle
            )));
        }
        state.sent.push((handle, bytes.to_vec()));
        Ok(())
    }

    async fn close_channel(&self, handle: ChannelHandle) {
        let existed = {
            let mut state = self.state.write();
            state.pending_opens.remove(&handle);
            state.channels.remove(&handle).is_some()
        };
        if existed {
            let _ = self
                .events
                .send((self.kind, AdapterEvent::ChannelClosed { handle }));
        }
    }

    async fn recover(&self) -> Result<(), AdapterError> {
        self.state.write().recover_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_adapter(kind: TransportKind) -> (LoopbackAdapter, mpsc::UnboundedReceiver<(TransportKind, AdapterEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopbackAdapter::new(kind, tx), rx)
    }

    #[tokio::test]
    async fn test_scan_requires_initialize() {
        let (adapter, _rx) = make_adapter(TransportKind::Local);
        assert!(matches!(
            adapter.start_scan().await,
            Err(AdapterError::NotInitialized)
        ));

        adapter.initialize().await.unwrap();
        adapter.start_scan().await.unwrap();
        assert!(adapter.is_scanning());
    }

    #[tokio::test]
    async fn test_double_scan_already_started() {
        let (adapter, _rx) = make_adapter(TransportKind::Local);
        adapter.initialize().await.unwrap();
        adapter.start_scan().await.unwrap();
        assert!(matches!(
            adapter.start_scan().await,
            Err(AdapterError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_advertise_lifecycle() {
        let (adapter, _rx) = make_adapter(TransportKind::BLE);
        adapter.initialize().await.unwrap();
        adapter.start_advertise("node-1").await.unwrap();
        assert_eq!(adapter.advertised_identity().as_deref(), Some("node-1"));
        adapter.stop_advertise().await.unwrap();
        assert!(adapter.advertised_identity().is_none());
    }

    #[tokio::test]
    async fn test_auto_confirm_emits_channel_opened() {
        let (adapter, mut rx) = make_adapter(TransportKind::Local);
        adapter.initialize().await.unwrap();
        let handle = adapter
            .open_channel("peer-a", ChannelParams::default())
            .await
            .unwrap();

        let (kind, event) = rx.recv().await.expect("event");
        assert_eq!(kind, TransportKind::Local);
        match event {
            AdapterEvent::ChannelOpened {
                handle: h,
                peer_address,
            } => {
                assert_eq!(h, handle);
                assert_eq!(peer_address, "peer-a");
            }
            other => panic!("unexpected event {}", other),
        }
    }

    #[tokio::test]
    async fn test_manual_confirm_holds_open() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = LoopbackAdapter::manual_confirm(TransportKind::BLE, tx);
        adapter.initialize().await.unwrap();
        let handle = adapter
            .open_channel("peer-b", ChannelParams::default())
            .await
            .unwrap();

        assert_eq!(adapter.pending_opens(), vec![handle]);
        assert!(rx.try_recv().is_err());

        adapter.confirm_open(handle);
        let (_, event) = rx.recv().await.expect("event");
        assert!(matches!(event, AdapterEvent::ChannelOpened { .. }));
    }

    #[tokio::test]
    async fn test_send_requires_open_channel() {
        let (adapter, _rx) = make_adapter(TransportKind::Local);
        adapter.initialize().await.unwrap();
        let err = adapter
            .send_on_channel(ChannelHandle(99), b"hi")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::ChannelFailed(_)));

        let handle = adapter
            .open_channel("peer-a", ChannelParams::default())
            .await
            .unwrap();
        adapter.send_on_channel(handle, b"hi").await.unwrap();
        assert_eq!(adapter.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_close_channel_idempotent() {
        let (adapter, mut rx) = make_adapter(TransportKind::Local);
        adapter.initialize().await.unwrap();
        let handle = adapter
            .open_channel("peer-a", ChannelParams::default())
            .await
            .unwrap();
        let _ = rx.recv().await; // ChannelOpened

        adapter.close_channel(handle).await;
        let (_, event) = rx.recv().await.expect("event");
        assert!(matches!(event, AdapterEvent::ChannelClosed { .. }));

        // Second close emits nothing
        adapter.close_channel(handle).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_channel_emits_error() {
        let (adapter, mut rx) = make_adapter(TransportKind::Local);
        adapter.initialize().await.unwrap();
        let handle = adapter
            .open_channel("peer-a", ChannelParams::default())
            .await
            .unwrap();
        let _ = rx.recv().await; // ChannelOpened

        adapter.fail_channel(handle, "radio off");
        let (_, event) = rx.recv().await.expect("event");
        match event {
            AdapterEvent::ChannelError { reason, .. } => assert_eq!(reason, "radio off"),
            other => panic!("unexpected event {}", other),
        }
    }

    #[tokio::test]
    async fn test_recover_counts() {
        let (adapter, _rx) = make_adapter(TransportKind::Local);
        assert_eq!(adapter.recover_calls(), 0);
        adapter.recover().await.unwrap();
        adapter.recover().await.unwrap();
        assert_eq!(adapter.recover_calls(), 2);
    }
}
