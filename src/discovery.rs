//! Peer discovery adapter (spec §4.C).
//!
//! The service-discovery agent is an external collaborator (spec §1): it
//! pushes `add_peer`/`remove_peer` calls onto the relay over a bounded
//! channel rather than this module polling for peers itself. This mirrors
//! `forwarder::discovery::expand_target`'s separation between "resolve
//! what a peer endpoint means" and the connection the caller then drives;
//! here the resolving is external and this module only tracks the result.
//!
//! State updates never perform blocking I/O inline — connect/disconnect
//! requests are handed to the socket lifecycle component (`sockets.rs`) via
//! an outgoing command queue, so a slow or wedged connect can't stall the
//! discovery callback path.

use std::collections::HashMap;
use std::time::Instant;

/// Which relay-owned socket a peer update applies to. The adapter keeps one
/// peer table per socket since the same peer-id can mean different things
/// on different sockets (spec §4.C: "per relay-owned socket").
pub type SocketTag = String;

/// A peer's tracked state on one socket.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub endpoint: String,
    pub last_seen: Instant,
    pub connected: bool,
}

/// A pending connect/disconnect request the adapter has queued for the
/// socket lifecycle component to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectAction {
    Connect { socket_tag: SocketTag, peer_id: String, endpoint: String },
    Disconnect { socket_tag: SocketTag, peer_id: String },
}

/// Per-socket peer-id → state tables, plus a queue of connect actions for
/// the socket lifecycle component to drain.
#[derive(Default)]
pub struct DiscoveryAdapter {
    tables: HashMap<SocketTag, HashMap<String, PeerState>>,
    pending: Vec<ConnectAction>,
}

impl DiscoveryAdapter {
    pub fn new() -> Self {
        DiscoveryAdapter::default()
    }

    /// Called by the discovery agent when a peer appears or its endpoint
    /// changes. Enqueues a connect action; never performs I/O itself.
    pub fn add_peer(&mut self, socket_tag: impl Into<String>, peer_id: impl Into<String>, endpoint: impl Into<String>) {
        let socket_tag = socket_tag.into();
        let peer_id = peer_id.into();
        let endpoint = endpoint.into();
        let table = self.tables.entry(socket_tag.clone()).or_default();
        table.insert(
            peer_id.clone(),
            PeerState {
                endpoint: endpoint.clone(),
                last_seen: Instant::now(),
                connected: false,
            },
        );
        self.pending.push(ConnectAction::Connect {
            socket_tag,
            peer_id,
            endpoint,
        });
    }

    /// Called by the discovery agent when a peer drops out. Enqueues a
    /// disconnect action and removes the peer from the table.
    pub fn remove_peer(&mut self, socket_tag: impl Into<String>, peer_id: impl Into<String>) {
        let socket_tag = socket_tag.into();
        let peer_id = peer_id.into();
        if let Some(table) = self.tables.get_mut(&socket_tag) {
            table.remove(&peer_id);
        }
        self.pending.push(ConnectAction::Disconnect { socket_tag, peer_id });
    }

    /// Mark a peer connected once the socket lifecycle component confirms
    /// the connect succeeded.
    pub fn mark_connected(&mut self, socket_tag: &str, peer_id: &str) {
        if let Some(state) = self.tables.get_mut(socket_tag).and_then(|t| t.get_mut(peer_id)) {
            state.connected = true;
            state.last_seen = Instant::now();
        }
    }

    pub fn touch(&mut self, socket_tag: &str, peer_id: &str) {
        if let Some(state) = self.tables.get_mut(socket_tag).and_then(|t| t.get_mut(peer_id)) {
            state.last_seen = Instant::now();
        }
    }

    pub fn peer(&self, socket_tag: &str, peer_id: &str) -> Option<&PeerState> {
        self.tables.get(socket_tag).and_then(|t| t.get(peer_id))
    }

    pub fn peer_count(&self, socket_tag: &str) -> usize {
        self.tables.get(socket_tag).map(|t| t.len()).unwrap_or(0)
    }

    /// Drain all pending connect/disconnect actions for the socket
    /// lifecycle component to execute.
    pub fn drain_pending(&mut self) -> Vec<ConnectAction> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_peer_queues_a_connect_action_and_tracks_state() {
        let mut adapter = DiscoveryAdapter::new();
        adapter.add_peer("mm_snd", "peer-a", "10.0.0.1:9000");
        assert_eq!(adapter.peer_count("mm_snd"), 1);
        let peer = adapter.peer("mm_snd", "peer-a").unwrap();
        assert!(!peer.connected);
        assert_eq!(peer.endpoint, "10.0.0.1:9000");

        let pending = adapter.drain_pending();
        assert_eq!(
            pending,
            vec![ConnectAction::Connect {
                socket_tag: "mm_snd".into(),
                peer_id: "peer-a".into(),
                endpoint: "10.0.0.1:9000".into(),
            }]
        );
        assert!(adapter.drain_pending().is_empty());
    }

    #[test]
    fn remove_peer_drops_state_and_queues_a_disconnect() {
        let mut adapter = DiscoveryAdapter::new();
        adapter.add_peer("mm_snd", "peer-a", "10.0.0.1:9000");
        adapter.drain_pending();
        adapter.remove_peer("mm_snd", "peer-a");
        assert!(adapter.peer("mm_snd", "peer-a").is_none());
        let pending = adapter.drain_pending();
        assert_eq!(
            pending,
            vec![ConnectAction::Disconnect {
                socket_tag: "mm_snd".into(),
                peer_id: "peer-a".into(),
            }]
        );
    }

    #[test]
    fn peer_tables_are_scoped_per_socket_tag() {
        let mut adapter = DiscoveryAdapter::new();
        adapter.add_peer("mm_snd", "peer-a", "10.0.0.1:9000");
        adapter.add_peer("log_pub", "peer-a", "10.0.0.1:9100");
        assert_eq!(adapter.peer_count("mm_snd"), 1);
        assert_eq!(adapter.peer_count("log_pub"), 1);
        assert_ne!(
            adapter.peer("mm_snd", "peer-a").unwrap().endpoint,
            adapter.peer("log_pub", "peer-a").unwrap().endpoint
        );
    }

    #[test]
    fn mark_connected_flips_state_without_touching_the_queue() {
        let mut adapter = DiscoveryAdapter::new();
        adapter.add_peer("mm_snd", "peer-a", "10.0.0.1:9000");
        adapter.drain_pending();
        adapter.mark_connected("mm_snd", "peer-a");
        assert!(adapter.peer("mm_snd", "peer-a").unwrap().connected);
        assert!(adapter.drain_pending().is_empty());
    }
}
