//! In-process simulated network
//!
//! A shared medium that relays CBOR-encoded operations between simulated
//! devices. A device taken offline cannot send, and frames addressed to it
//! are held until it comes back, like a relay server with store-and-forward.
//! Used for integration testing without a real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use super::host::{Transport, TransportError};
use crate::clock::DeviceId;
use crate::operation::SyncOperation;
use crate::queue::Priority;

struct SimPeer {
    inbound: broadcast::Sender<SyncOperation>,
    online: bool,
    /// Frames that arrived while offline
    backlog: Vec<Vec<u8>>,
}

/// The simulated "air" shared by every device.
pub struct SimNetwork {
    peers: Mutex<HashMap<DeviceId, SimPeer>>,
    /// Deliver every frame twice
    duplicate: AtomicBool,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            duplicate: AtomicBool::new(false),
        })
    }

    /// Attach a device to the network, online.
    pub async fn create_transport(self: &Arc<Self>, device_id: impl Into<DeviceId>) -> SimTransport {
        let device_id = device_id.into();
        let (inbound, _) = broadcast::channel(256);
        self.peers.lock().await.insert(
            device_id.clone(),
            SimPeer {
                inbound: inbound.clone(),
                online: true,
                backlog: Vec::new(),
            },
        );
        SimTransport {
            device_id,
            network: Arc::clone(self),
            inbound,
        }
    }

    pub fn set_duplicate_deliveries(&self, on: bool) {
        self.duplicate.store(on, Ordering::SeqCst);
    }

    async fn relay(&self, from: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut peers = self.peers.lock().await;
        match peers.get(from) {
            Some(peer) if peer.online => {}
            _ => return Err(TransportError::Offline),
        }

        let copies = if self.duplicate.load(Ordering::SeqCst) { 2 } else { 1 };
        for (id, peer) in peers.iter_mut() {
            if id == from {
                continue;
            }
            for _ in 0..copies {
                if peer.online {
                    deliver(peer, &frame);
                } else {
                    peer.backlog.push(frame.clone());
                }
            }
        }
        Ok(())
    }

    async fn set_online(&self, device_id: &str, online: bool) {
        let mut peers = self.peers.lock().await;
        let Some(peer) = peers.get_mut(device_id) else {
            return;
        };
        peer.online = online;
        if online {
            let backlog = std::mem::take(&mut peer.backlog);
            log::debug!("{} back online, delivering {} held frame(s)", device_id, backlog.len());
            for frame in backlog {
                deliver(peer, &frame);
            }
        }
    }

    async fn is_online(&self, device_id: &str) -> bool {
        self.peers
            .lock()
            .await
            .get(device_id)
            .map(|p| p.online)
            .unwrap_or(false)
    }
}

fn deliver(peer: &SimPeer, frame: &[u8]) {
    match SyncOperation::from_cbor(frame) {
        Ok(op) => {
            // Nobody listening yet is fine
            let _ = peer.inbound.send(op);
        }
        Err(e) => log::warn!("Dropping undecodable frame: {}", e),
    }
}

/// One device's attachment to a [`SimNetwork`].
pub struct SimTransport {
    device_id: DeviceId,
    network: Arc<SimNetwork>,
    inbound: broadcast::Sender<SyncOperation>,
}

impl SimTransport {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Take the link down or bring it back. Coming back delivers held frames.
    pub async fn set_online(&self, online: bool) {
        self.network.set_online(&self.device_id, online).await;
    }

    pub async fn is_online(&self) -> bool {
        self.network.is_online(&self.device_id).await
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn send(&self, op: &SyncOperation, _priority: Priority) -> Result<(), TransportError> {
        let frame = op.to_cbor().map_err(|e| TransportError::Io(e.to_string()))?;
        self.network.relay(&self.device_id, frame).await
    }

    fn incoming(&self) -> broadcast::Receiver<SyncOperation> {
        self.inbound.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use serde_json::json;

    fn op(device: &str) -> SyncOperation {
        SyncOperation::new(
            "set_field",
            json!({"id": "t1", "field": "title", "value": "x"}),
            "tasks",
            device.to_string(),
            1,
            VectorClock::at(device, 1),
        )
    }

    #[tokio::test]
    async fn test_relay_skips_sender() {
        let net = SimNetwork::new();
        let a = net.create_transport("A").await;
        let b = net.create_transport("B").await;
        let mut rx_a = a.incoming();
        let mut rx_b = b.incoming();

        let sent = op("A");
        a.send(&sent, Priority::Normal).await.unwrap();

        assert_eq!(rx_b.recv().await.unwrap(), sent);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_sender_fails_and_receiver_gets_backlog() {
        let net = SimNetwork::new();
        let a = net.create_transport("A").await;
        let b = net.create_transport("B").await;
        let mut rx_b = b.incoming();

        a.set_online(false).await;
        assert_eq!(
            a.send(&op("A"), Priority::Critical).await,
            Err(TransportError::Offline)
        );
        a.set_online(true).await;

        b.set_online(false).await;
        let held = op("A");
        a.send(&held, Priority::Normal).await.unwrap();
        assert!(rx_b.try_recv().is_err());

        b.set_online(true).await;
        assert_eq!(rx_b.recv().await.unwrap(), held);
    }

    #[tokio::test]
    async fn test_duplicate_deliveries() {
        let net = SimNetwork::new();
        let a = net.create_transport("A").await;
        let b = net.create_transport("B").await;
        let mut rx_b = b.incoming();
        net.set_duplicate_deliveries(true);

        let sent = op("A");
        a.send(&sent, Priority::Normal).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap().id, sent.id);
        assert_eq!(rx_b.recv().await.unwrap().id, sent.id);
    }
}
