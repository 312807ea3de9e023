//! Socket lifecycle (spec §4.H).
//!
//! Models the relay's six named channels as TCP listeners/streams framed
//! with `codec.rs`. Master-only sockets (write-submission, log-submission,
//! log-publication) are destroyed on demotion and reconstructed fresh on
//! promotion, since the framing here — like the ZMQ sockets it replaces —
//! cannot rebind a live endpoint. All port/timeout state needed to
//! reconstruct lives in [`SocketConfig`], held by the caller (the relay
//! object), never on the socket handle itself, per spec §9.
//!
//! Raw `TcpListener`/`TcpStream` plus manual framing, rather than a
//! higher-level server crate, follows the precedent in
//! `forwarder::status_http::StatusServer`, which hand-rolls its listener
//! for the same reason: this is a low-level transport concern, not an
//! application-level HTTP surface.

use crate::error::SocketError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Port/timeout configuration needed to (re)construct every socket. Kept
/// separate from the handles so a destroy/reconstruct cycle never loses
/// its settings (spec §9: "all state required for reconstruction lives on
/// the role controller, not on the socket handle").
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub bind_addr: SocketAddr,
    pub clt_sub_port: u16,
    pub log_sub_port: u16,
    pub log_pub_port: u16,
    pub mm_snd_port: u16,
}

impl SocketConfig {
    fn addr(&self, port: u16) -> SocketAddr {
        let mut addr = self.bind_addr;
        addr.set_port(port);
        addr
    }
}

/// The always-present sockets: read submission and the peer channel exist
/// regardless of role. Wrapped in `Arc` so the accept-loop tasks in
/// `transport.rs` can each hold a clone and call `TcpListener::accept(&self)`
/// concurrently without borrowing the lifecycle itself.
pub struct BaseSockets {
    pub read_submission: Arc<TcpListener>,
    pub peer: Arc<TcpListener>,
}

/// The master-only sockets: constructed on promotion, torn down on
/// demotion. `shutdown` is notified on `destroy_master_sockets`, which is
/// how the accept-loop tasks in `transport.rs` learn to stop — dropping our
/// own `Arc<TcpListener>` clone alone wouldn't close the socket while an
/// accept loop still holds its clone mid-`accept().await`.
pub struct MasterSockets {
    pub write_submission: Arc<TcpListener>,
    pub log_submission: Arc<TcpListener>,
    pub log_publication: Arc<TcpListener>,
    pub shutdown: Arc<Notify>,
}

/// Owns every socket handle the relay currently holds. `master` is `None`
/// while standby.
pub struct SocketLifecycle {
    config: SocketConfig,
    base: Option<BaseSockets>,
    master: Option<MasterSockets>,
}

impl SocketLifecycle {
    pub fn new(config: SocketConfig) -> Self {
        SocketLifecycle {
            config,
            base: None,
            master: None,
        }
    }

    pub fn has_master_sockets(&self) -> bool {
        self.master.is_some()
    }

    /// Bind the always-present sockets. Called once at startup, regardless
    /// of initial role.
    pub async fn bind_base(&mut self) -> Result<(), SocketError> {
        let read_addr = self.config.addr(self.config.clt_sub_port + 1);
        let read_submission = TcpListener::bind(read_addr)
            .await
            .map_err(|source| SocketError::Bind { addr: read_addr.to_string(), source })?;
        let peer_addr = self.config.addr(self.config.mm_snd_port);
        let peer = TcpListener::bind(peer_addr)
            .await
            .map_err(|source| SocketError::Bind { addr: peer_addr.to_string(), source })?;
        self.base = Some(BaseSockets {
            read_submission: Arc::new(read_submission),
            peer: Arc::new(peer),
        });
        Ok(())
    }

    pub fn base(&self) -> Result<&BaseSockets, SocketError> {
        self.base.as_ref().ok_or(SocketError::NotConstructed)
    }

    /// Construct the master-only sockets on promotion. Spec §4.H: the
    /// master owns write-submission and the log sockets.
    pub async fn construct_master_sockets(&mut self) -> Result<(), SocketError> {
        let write_addr = self.config.addr(self.config.clt_sub_port);
        let write_submission = TcpListener::bind(write_addr)
            .await
            .map_err(|source| SocketError::Bind { addr: write_addr.to_string(), source })?;
        let log_sub_addr = self.config.addr(self.config.log_sub_port);
        let log_submission = TcpListener::bind(log_sub_addr)
            .await
            .map_err(|source| SocketError::Bind { addr: log_sub_addr.to_string(), source })?;
        let log_pub_addr = self.config.addr(self.config.log_pub_port);
        let log_publication = TcpListener::bind(log_pub_addr)
            .await
            .map_err(|source| SocketError::Bind { addr: log_pub_addr.to_string(), source })?;
        self.master = Some(MasterSockets {
            write_submission: Arc::new(write_submission),
            log_submission: Arc::new(log_submission),
            log_publication: Arc::new(log_publication),
            shutdown: Arc::new(Notify::new()),
        });
        Ok(())
    }

    /// Tear down the master-only sockets on demotion. Notifies any running
    /// accept loops to stop, then drops our own listener handles; a future
    /// promotion rebinds fresh ones, since some listeners cannot rebind the
    /// same port in the same process without first being dropped.
    pub fn destroy_master_sockets(&mut self) {
        if let Some(master) = self.master.take() {
            master.shutdown.notify_waiters();
        }
    }

    pub fn master(&self) -> Result<&MasterSockets, SocketError> {
        self.master.as_ref().ok_or(SocketError::NotConstructed)
    }

    pub async fn connect_peer(&self, addr: SocketAddr) -> Result<TcpStream, SocketError> {
        TcpStream::connect(addr)
            .await
            .map_err(|source| SocketError::Connect { addr: addr.to_string(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config() -> SocketConfig {
        // port 0 lets the OS assign an ephemeral free port, so tests never
        // collide with each other or with a real deployment.
        SocketConfig {
            bind_addr: SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            clt_sub_port: 0,
            log_sub_port: 0,
            log_pub_port: 0,
            mm_snd_port: 0,
        }
    }

    #[tokio::test]
    async fn base_sockets_bind_and_are_retrievable() {
        let mut lifecycle = SocketLifecycle::new(test_config());
        assert!(lifecycle.base().is_err());
        lifecycle.bind_base().await.unwrap();
        assert!(lifecycle.base().is_ok());
    }

    #[tokio::test]
    async fn master_sockets_are_absent_until_constructed_and_gone_after_destroy() {
        let mut lifecycle = SocketLifecycle::new(test_config());
        assert!(!lifecycle.has_master_sockets());
        lifecycle.construct_master_sockets().await.unwrap();
        assert!(lifecycle.has_master_sockets());
        assert!(lifecycle.master().is_ok());
        lifecycle.destroy_master_sockets();
        assert!(!lifecycle.has_master_sockets());
        assert!(lifecycle.master().is_err());
    }

    #[tokio::test]
    async fn master_sockets_can_be_reconstructed_after_destroy() {
        let mut lifecycle = SocketLifecycle::new(test_config());
        lifecycle.construct_master_sockets().await.unwrap();
        lifecycle.destroy_master_sockets();
        lifecycle.construct_master_sockets().await.unwrap();
        assert!(lifecycle.has_master_sockets());
    }

    #[tokio::test]
    async fn connect_to_an_unbound_address_surfaces_a_connect_error() {
        let lifecycle = SocketLifecycle::new(test_config());
        // Port 1 is a reserved, almost certainly closed port on loopback.
        let addr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let result = lifecycle.connect_peer(addr).await;
        assert!(result.is_err());
    }
}
