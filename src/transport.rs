//! Socket-to-pipeline glue (spec §4.F/§4.H boundary).
//!
//! `sockets.rs` only hands out bound `TcpListener`/`TcpStream` handles;
//! `pipeline.rs` only knows `mpsc` channels and the `ReplySink`/`LogSink`/
//! `PeerSink` traits. This module is the part that actually reads and
//! writes frames on the wire: one spawned task per accepted connection
//! decodes frames into the pipeline's inbound types and forwards them over
//! a channel, mirroring the per-connection task split in
//! `services/server/src/ws_forwarder.rs` (a reader task feeding a command
//! channel, a writer task draining an outbound one). Replies are routed
//! back to the connection that submitted the request by client id, kept in
//! a small in-memory registry — the wire has no separate addressing layer.

use crate::codec::{self, Part};
use crate::error::CodecError;
use crate::model::{Fingerprint, LogRecord, ReplyFrame};
use crate::pipeline::{LogSink, PeerFrame, PeerSink, ReplySink, Submission};
use crate::role::NegotiationClaim;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

/// Accept on a listener, or stop if `shutdown` (when given) is notified —
/// the mechanism `destroy_master_sockets` uses to end an accept loop whose
/// listener it no longer holds a reference to.
async fn accept_or_shutdown(
    listener: &TcpListener,
    shutdown: Option<&Notify>,
) -> Option<std::io::Result<(TcpStream, std::net::SocketAddr)>> {
    match shutdown {
        Some(notify) => tokio::select! {
            result = listener.accept() => Some(result),
            _ = notify.notified() => None,
        },
        None => Some(listener.accept().await),
    }
}

/// Per-client outbound reply queues, keyed by the client id carried in each
/// submission frame. A client's connection registers its sender the moment
/// its first frame arrives; `TcpReplySink::try_send` looks it up by
/// fingerprint. Unbounded so `try_send` never has to choose between
/// blocking and dropping a reply the pipeline has already decided to send.
pub type ClientRegistry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ReplyFrame>>>>;

fn decode_submission(parts: Vec<Vec<u8>>) -> Result<Submission, CodecError> {
    if parts.len() < 3 {
        return Err(CodecError::EmptyFrame);
    }
    let client_id = codec::part_as_string(&parts[0])?;
    let msg_id = codec::part_as_u32(&parts[1])?;
    let sql = codec::part_as_string(&parts[2])?;
    Ok(Submission {
        fingerprint: Fingerprint::new(client_id, msg_id),
        sql,
    })
}

fn encode_reply(client_id: &str, reply: &ReplyFrame) -> Vec<Part> {
    vec![
        Part::from(client_id.to_owned()),
        Part::from(reply.msg_id),
        Part::from(reply.status.code()),
        Part::from(reply.payload.clone()),
    ]
}

fn decode_log_record(parts: Vec<Vec<u8>>) -> Result<LogRecord, CodecError> {
    if parts.len() < 4 {
        return Err(CodecError::EmptyFrame);
    }
    let client_id = codec::part_as_string(&parts[0])?;
    let timestamp = codec::part_as_string(&parts[1])?;
    let severity = codec::part_as_u32(&parts[2])?;
    let message = codec::part_as_string(&parts[3])?;
    Ok(LogRecord::new(client_id, timestamp, severity, message))
}

fn encode_log_record(record: &LogRecord) -> Vec<Part> {
    vec![
        Part::from(record.client_id.clone()),
        Part::from(record.timestamp.clone()),
        Part::from(record.severity),
        Part::from(record.message.clone()),
    ]
}

const PEER_FRAME_HEARTBEAT: &str = "HB";
const PEER_FRAME_NEGOTIATION: &str = "NEG";

fn decode_peer_frame(parts: Vec<Vec<u8>>) -> Result<PeerFrame, CodecError> {
    let kind = codec::part_as_string(parts.first().ok_or(CodecError::EmptyFrame)?)?;
    match kind.as_str() {
        PEER_FRAME_HEARTBEAT => Ok(PeerFrame::Heartbeat),
        PEER_FRAME_NEGOTIATION => {
            if parts.len() < 3 {
                return Err(CodecError::EmptyFrame);
            }
            let last_update_raw = codec::part_as_string(&parts[1])?;
            let last_update = chrono::DateTime::parse_from_rfc3339(&last_update_raw)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|_| CodecError::InvalidTimestamp(last_update_raw.clone()))?;
            let header = codec::part_as_string(&parts[2])?;
            Ok(PeerFrame::Negotiation(NegotiationClaim { last_update, header }))
        }
        _ => Err(CodecError::EmptyFrame),
    }
}

fn encode_heartbeat() -> Vec<Part> {
    vec![Part::from(PEER_FRAME_HEARTBEAT)]
}

fn encode_negotiation(claim: &NegotiationClaim) -> Vec<Part> {
    vec![
        Part::from(PEER_FRAME_NEGOTIATION),
        Part::from(claim.last_update.to_rfc3339()),
        Part::from(claim.header.clone()),
    ]
}

/// Accept loop for a submission socket (write-submission or
/// read-submission): one task per connection reads frames in a loop,
/// decodes each as a [`Submission`], registers the connection's reply
/// sender under its client id on first sight, and forwards the submission
/// to the pipeline. Runs until the listener or the channel closes.
pub fn spawn_submission_acceptor(
    listener: Arc<TcpListener>,
    tx: mpsc::Sender<Submission>,
    registry: ClientRegistry,
    socket_tag: &'static str,
    shutdown: Option<Arc<Notify>>,
) {
    tokio::spawn(async move {
        loop {
            let accepted = accept_or_shutdown(&listener, shutdown.as_deref()).await;
            let (stream, peer_addr) = match accepted {
                None => break,
                Some(Ok(pair)) => pair,
                Some(Err(e)) => {
                    warn!(socket = socket_tag, error = %e, "accept failed");
                    continue;
                }
            };
            debug!(socket = socket_tag, %peer_addr, "submission client connected");
            let tx = tx.clone();
            let registry = registry.clone();
            tokio::spawn(handle_submission_connection(stream, tx, registry, socket_tag));
        }
    });
}

async fn handle_submission_connection(
    stream: TcpStream,
    tx: mpsc::Sender<Submission>,
    registry: ClientRegistry,
    socket_tag: &'static str,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ReplyFrame>();
    let mut registered_client: Option<String> = None;

    let writer_task = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let client_id = reply_client_id(&reply);
            let parts = encode_reply(&client_id, &reply);
            if codec::write_frame(&mut writer, &parts).await.is_err() {
                break;
            }
        }
    });

    loop {
        let parts = match codec::read_frame(&mut reader).await {
            Ok(parts) => parts,
            Err(_) => break,
        };
        let submission = match decode_submission(parts) {
            Ok(s) => s,
            Err(e) => {
                warn!(socket = socket_tag, error = %e, "dropping malformed submission frame");
                continue;
            }
        };
        if registered_client.as_deref() != Some(submission.fingerprint.client_id.as_str()) {
            registry
                .lock()
                .await
                .insert(submission.fingerprint.client_id.clone(), reply_tx.clone());
            registered_client = Some(submission.fingerprint.client_id.clone());
        }
        if tx.send(submission).await.is_err() {
            break;
        }
    }

    if let Some(client_id) = registered_client {
        registry.lock().await.remove(&client_id);
    }
    writer_task.abort();
}

/// A `ReplyFrame` alone doesn't carry the client id it's addressed to
/// (that's the fingerprint); the pipeline hands both to `try_send`, so the
/// sink stores the client id alongside the reply before it reaches the
/// per-connection writer task.
fn reply_client_id(reply: &ReplyFrame) -> String {
    reply.routed_client_id.clone()
}

/// Reply sink backed by the client registry built up by submission accept
/// loops. Looks up the submitting connection by client id and hands off
/// the reply to its dedicated writer task; `try_send` is non-blocking
/// because the channel is unbounded and the lookup itself never awaits.
pub struct TcpReplySink {
    registry: ClientRegistry,
}

impl TcpReplySink {
    pub fn new(registry: ClientRegistry) -> Self {
        TcpReplySink { registry }
    }
}

impl ReplySink for TcpReplySink {
    fn try_send(&mut self, fingerprint: &Fingerprint, reply: &ReplyFrame) -> bool {
        let Ok(table) = self.registry.try_lock() else {
            return false;
        };
        match table.get(&fingerprint.client_id) {
            Some(sender) => {
                let mut routed = reply.clone();
                routed.routed_client_id = fingerprint.client_id.clone();
                sender.send(routed).is_ok()
            }
            None => false,
        }
    }
}

/// Accept loop for the log-submission socket: decodes each frame as a
/// [`LogRecord`] and forwards it to the pipeline's inbound log channel
/// (spec §4.F step 4). Client identity here is informational only — no
/// reply is ever sent back on this socket.
pub fn spawn_log_acceptor(listener: Arc<TcpListener>, tx: mpsc::Sender<LogRecord>, shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match accept_or_shutdown(&listener, Some(&shutdown)).await {
                None => break,
                Some(Ok(pair)) => pair,
                Some(Err(e)) => {
                    warn!(socket = "log_submission", error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%peer_addr, "log submission client connected");
            let tx = tx.clone();
            tokio::spawn(async move {
                let (mut reader, _writer) = stream.into_split();
                loop {
                    let parts = match codec::read_frame(&mut reader).await {
                        Ok(parts) => parts,
                        Err(_) => break,
                    };
                    match decode_log_record(parts) {
                        Ok(record) => {
                            if tx.send(record).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed log frame"),
                    }
                }
            });
        }
    });
}

/// Broadcast target for the log-publication socket: every currently
/// connected subscriber gets a copy of each outbound log record. Modelled
/// the same way as the peer sink, since both are "one frame in, fan out to
/// whoever is currently listening" sockets.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<Part>>>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        SubscriberRegistry::default()
    }

    async fn add(&self, sender: mpsc::UnboundedSender<Vec<Part>>) {
        self.subscribers.lock().await.push(sender);
    }

    /// Send `parts` to every live subscriber, pruning any whose receiver
    /// has gone away. Returns `true` if at least one subscriber is still
    /// connected and accepted the frame.
    fn try_broadcast(&self, parts: Vec<Part>) -> bool {
        let Ok(mut subs) = self.subscribers.try_lock() else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.send(parts.clone()).is_ok());
        before > 0 && !subs.is_empty()
    }
}

/// Accept loop for the log-publication socket: each connection is a
/// subscriber that receives every outbound log record written via
/// [`LogPublicationSink`] until it disconnects.
pub fn spawn_log_publication_acceptor(
    listener: Arc<TcpListener>,
    registry: SubscriberRegistry,
    shutdown: Arc<Notify>,
) {
    tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match accept_or_shutdown(&listener, Some(&shutdown)).await {
                None => break,
                Some(Ok(pair)) => pair,
                Some(Err(e)) => {
                    warn!(socket = "log_publication", error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%peer_addr, "log publication subscriber connected");
            let (_reader, mut writer) = stream.into_split();
            let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<Vec<Part>>();
            registry.add(sub_tx).await;
            tokio::spawn(async move {
                while let Some(parts) = sub_rx.recv().await {
                    if codec::write_frame(&mut writer, &parts).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

pub struct LogPublicationSink {
    registry: SubscriberRegistry,
}

impl LogPublicationSink {
    pub fn new(registry: SubscriberRegistry) -> Self {
        LogPublicationSink { registry }
    }
}

impl LogSink for LogPublicationSink {
    fn try_send(&mut self, record: &LogRecord) -> bool {
        self.registry.try_broadcast(encode_log_record(record))
    }
}

/// Accept loop for the peer (mm) socket: the other relay connects here to
/// exchange heartbeats and negotiation claims. Each accepted connection's
/// frames are decoded into [`PeerFrame`]s and forwarded to the pipeline;
/// its writer half is registered as the current outbound target for
/// [`PeerBroadcastSink`].
pub fn spawn_peer_acceptor(listener: Arc<TcpListener>, tx: mpsc::Sender<PeerFrame>, outbound: PeerConnectionSlot) {
    tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(socket = "peer", error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%peer_addr, "peer connected");
            let tx = tx.clone();
            let outbound = outbound.clone();
            tokio::spawn(handle_peer_connection(stream, tx, outbound));
        }
    });
}

async fn handle_peer_connection(stream: TcpStream, tx: mpsc::Sender<PeerFrame>, outbound: PeerConnectionSlot) {
    let connection_id = tokio::task::id();
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<Part>>();
    outbound.set(connection_id, out_tx).await;

    let writer_task = tokio::spawn(async move {
        while let Some(parts) = out_rx.recv().await {
            if codec::write_frame(&mut writer, &parts).await.is_err() {
                break;
            }
        }
    });

    loop {
        let parts = match codec::read_frame(&mut reader).await {
            Ok(parts) => parts,
            Err(_) => break,
        };
        match decode_peer_frame(parts) {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "dropping malformed peer frame"),
        }
    }
    outbound.clear_if_current(connection_id).await;
    writer_task.abort();
}

/// Holds the single outbound channel to whichever peer connection is
/// currently live — either accepted inbound on the peer socket, or dialled
/// out via `SocketLifecycle::connect_peer`. Only one peer matters at a
/// time (spec §4.G is a two-node protocol), so the slot just holds the most
/// recent connection rather than a full registry. Keyed by the reader
/// task's own `tokio::task::Id` (not the writer task's) so a connection
/// that loses the race to become current never clobbers a newer one's
/// cleanup.
#[derive(Clone, Default)]
pub struct PeerConnectionSlot {
    inner: Arc<Mutex<Option<(mpsc::UnboundedSender<Vec<Part>>, tokio::task::Id)>>>,
}

impl PeerConnectionSlot {
    pub fn new() -> Self {
        PeerConnectionSlot::default()
    }

    async fn set(&self, connection_id: tokio::task::Id, sender: mpsc::UnboundedSender<Vec<Part>>) {
        *self.inner.lock().await = Some((sender, connection_id));
    }

    async fn clear_if_current(&self, connection_id: tokio::task::Id) {
        let mut guard = self.inner.lock().await;
        if let Some((_, id)) = guard.as_ref() {
            if *id == connection_id {
                *guard = None;
            }
        }
    }

    fn try_send(&self, parts: Vec<Part>) -> bool {
        let Ok(guard) = self.inner.try_lock() else {
            return false;
        };
        match guard.as_ref() {
            Some((sender, _)) => sender.send(parts).is_ok(),
            None => false,
        }
    }
}

/// Outbound peer sink used by the pipeline's heartbeat/negotiation steps
/// (4.F steps 6 and 12): writes to whichever connection [`PeerConnectionSlot`]
/// currently holds.
pub struct PeerBroadcastSink {
    slot: PeerConnectionSlot,
}

impl PeerBroadcastSink {
    pub fn new(slot: PeerConnectionSlot) -> Self {
        PeerBroadcastSink { slot }
    }
}

impl PeerSink for PeerBroadcastSink {
    fn try_send_heartbeat(&mut self) -> bool {
        self.slot.try_send(encode_heartbeat())
    }

    fn try_send_negotiation(&mut self, claim: &NegotiationClaim) -> bool {
        self.slot.try_send(encode_negotiation(claim))
    }
}

/// Dial the peer relay and register the resulting connection as the
/// current outbound target, the mirror of `spawn_peer_acceptor`'s inbound
/// path for the case where this relay initiates the connection (e.g. after
/// `DiscoveryAdapter` reports a new peer endpoint).
pub async fn connect_outbound_peer(
    addr: std::net::SocketAddr,
    tx: mpsc::Sender<PeerFrame>,
    outbound: PeerConnectionSlot,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    tokio::spawn(handle_peer_connection(stream, tx, outbound));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StatusCode;

    #[test]
    fn decode_submission_reads_client_id_msg_id_and_sql() {
        let parts = vec![
            b"client-1".to_vec(),
            42u32.to_be_bytes().to_vec(),
            b"SELECT 1".to_vec(),
        ];
        let submission = decode_submission(parts).unwrap();
        assert_eq!(submission.fingerprint.client_id, "client-1");
        assert_eq!(submission.fingerprint.msg_id, 42);
        assert_eq!(submission.sql, "SELECT 1");
    }

    #[test]
    fn decode_peer_frame_round_trips_heartbeat_and_negotiation() {
        let hb = decode_peer_frame(vec![PEER_FRAME_HEARTBEAT.as_bytes().to_vec()]).unwrap();
        assert!(matches!(hb, PeerFrame::Heartbeat));

        let claim = NegotiationClaim {
            last_update: chrono::Utc::now(),
            header: "relay-a".into(),
        };
        let encoded = encode_negotiation(&claim);
        let raw = codec::flatten_parts(&encoded);
        let decoded = decode_peer_frame(raw).unwrap();
        match decoded {
            PeerFrame::Negotiation(got) => assert_eq!(got.header, "relay-a"),
            _ => panic!("expected negotiation frame"),
        }
    }

    #[tokio::test]
    async fn tcp_reply_sink_misses_unregistered_clients() {
        let registry: ClientRegistry = Arc::new(Mutex::new(HashMap::new()));
        let mut sink = TcpReplySink::new(registry);
        let fp = Fingerprint::new("ghost", 1);
        let reply = ReplyFrame::empty(1, StatusCode::Ok);
        assert!(!sink.try_send(&fp, &reply));
    }

    #[tokio::test]
    async fn tcp_reply_sink_delivers_to_the_registered_client() {
        let registry: ClientRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        registry.lock().await.insert("c1".to_owned(), reply_tx);
        let mut sink = TcpReplySink::new(registry);
        let fp = Fingerprint::new("c1", 7);
        let reply = ReplyFrame::empty(7, StatusCode::Ok);
        assert!(sink.try_send(&fp, &reply));
        let delivered = reply_rx.recv().await.unwrap();
        assert_eq!(delivered.routed_client_id, "c1");
    }

    #[test]
    fn peer_broadcast_sink_reports_failure_with_no_connection() {
        let mut sink = PeerBroadcastSink::new(PeerConnectionSlot::new());
        assert!(!sink.try_send_heartbeat());
    }
}
