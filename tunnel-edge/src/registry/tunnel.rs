//! Tunnel record (spec.md §3, §4.3): the in-memory state of one live
//! client association, and the two mailbox kinds carried on top of it.
//!
//! All mutable fields live behind a single `parking_lot::Mutex`; counters
//! are plain atomics so the periodic stats flush and `get_stats()` callers
//! never need to take the lock just to read a number. The lock is never
//! held across an `.await` — callers clone the channel they need while
//! holding it, drop the guard, then suspend on the clone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use tunnel_protocol::{ErrorFrame, RequestFrame, ResponseFrame};

use crate::error::EdgeError;
use crate::store::TunnelProtocol;

/// Bound on the per-tunnel request queue (spec.md §5).
pub const REQUEST_QUEUE_CAPACITY: usize = 100;
/// Default bound on a single request's response mailbox (spec.md §4.7).
pub const RESPONSE_MAILBOX_CAPACITY: usize = 10;
/// How long a dispatcher blocks against queue pressure before giving up
/// (spec.md §5 "Backpressure").
pub const REQUEST_QUEUE_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Active,
    Offline,
    Closed,
}

/// Distinguishes the ordinary chunked HTTP response-frame mailbox from the
/// raw byte pipe used once a WebSocket upgrade succeeds, and from a raw TCP
/// tunnel connection's mailbox (spec.md §9 redesign: a `(request_id, kind)`
/// tuple key replaces the original `"{id}:ws"` string-suffix convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxKind {
    Http,
    WebSocket,
    Tcp,
}

const ALL_MAILBOX_KINDS: [MailboxKind; 3] = [MailboxKind::Http, MailboxKind::WebSocket, MailboxKind::Tcp];

/// What arrives on a response mailbox: either a chunk of the response (HTTP
/// payload, TCP chunk, or raw post-upgrade bytes riding the same shape), or
/// an error frame the client sent for this request — propagated per the
/// §9 redesign so the HTTP path can answer 502 instead of timing out.
#[derive(Debug, Clone)]
pub enum MailboxMessage {
    Response(ResponseFrame),
    Error(ErrorFrame),
}

/// A point-in-time snapshot of a tunnel's public counters, safe to read
/// without holding the tunnel's lock across an await point (used by the
/// periodic stats flush and, eventually, the out-of-scope admin API).
#[derive(Debug, Clone)]
pub struct TunnelStats {
    pub id: Uuid,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub status: TunnelStatus,
    pub port: Option<u16>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests_count: u64,
    pub connected_at: u64,
    pub last_activity: u64,
}

struct Inner {
    status: TunnelStatus,
    local_addr: String,
    public_url: String,
    port: Option<u16>,
    last_activity: u64,
    /// `None` once `close()` has run; this is what makes queue closure
    /// exactly-once (spec.md §3 invariant).
    request_tx: Option<mpsc::Sender<RequestFrame>>,
    pending: HashMap<(Uuid, MailboxKind), mpsc::Sender<MailboxMessage>>,
}

pub struct Tunnel {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub saved_name: Option<String>,
    pub persistent: bool,
    pub connected_at: u64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    requests_count: AtomicU64,
    inner: Mutex<Inner>,
}

#[allow(clippy::too_many_arguments)]
impl Tunnel {
    /// Builds a fresh tunnel record and its request-queue receiver. The
    /// receiver must be handed to exactly one writer task (spec.md §4.6) —
    /// that single-writer discipline is a caller responsibility, not
    /// something this type can enforce by itself.
    pub fn new(
        id: Uuid,
        user_id: Uuid,
        token_id: Uuid,
        organization_id: Option<Uuid>,
        subdomain: String,
        protocol: TunnelProtocol,
        local_addr: String,
        public_url: String,
        port: Option<u16>,
        saved_name: Option<String>,
        connected_at: u64,
        seed_bytes_in: u64,
        seed_bytes_out: u64,
        seed_requests_count: u64,
    ) -> (Arc<Tunnel>, mpsc::Receiver<RequestFrame>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let persistent = saved_name.is_some();
        let tunnel = Tunnel {
            id,
            user_id,
            token_id,
            organization_id,
            subdomain,
            protocol,
            saved_name,
            persistent,
            connected_at,
            bytes_in: AtomicU64::new(seed_bytes_in),
            bytes_out: AtomicU64::new(seed_bytes_out),
            requests_count: AtomicU64::new(seed_requests_count),
            inner: Mutex::new(Inner {
                status: TunnelStatus::Active,
                local_addr,
                public_url,
                port,
                last_activity: connected_at,
                request_tx: Some(tx),
                pending: HashMap::new(),
            }),
        };
        (Arc::new(tunnel), rx)
    }

    pub fn status(&self) -> TunnelStatus {
        self.inner.lock().status
    }

    pub fn set_status(&self, status: TunnelStatus) {
        self.inner.lock().status = status;
    }

    pub fn local_addr(&self) -> String {
        self.inner.lock().local_addr.clone()
    }

    pub fn public_url(&self) -> String {
        self.inner.lock().public_url.clone()
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.lock().port
    }

    /// Rebinds the tunnel's connection-facing fields on reactivation
    /// (spec.md §4.5 "Reactivate"): new local address, new public URL, and
    /// (for TCP) the reallocated port — identity, subdomain, and cumulative
    /// counters are untouched.
    pub fn rebind(&self, local_addr: String, public_url: String, port: Option<u16>) {
        let mut inner = self.inner.lock();
        inner.local_addr = local_addr;
        inner.public_url = public_url;
        inner.port = port;
        inner.status = TunnelStatus::Active;
    }

    /// Installs a fresh request queue after reactivation — the old one was
    /// closed by [`Tunnel::close`] when the tunnel went offline.
    pub fn relaunch_request_queue(&self) -> mpsc::Receiver<RequestFrame> {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        self.inner.lock().request_tx = Some(tx);
        rx
    }

    pub fn update_activity(&self, now_unix_ms: u64) {
        self.inner.lock().last_activity = now_unix_ms;
    }

    /// Atomically bumps the byte counters and the request counter by one.
    pub fn update_stats(&self, delta_in: u64, delta_out: u64) {
        if delta_in > 0 {
            self.bytes_in.fetch_add(delta_in, Ordering::Relaxed);
        }
        if delta_out > 0 {
            self.bytes_out.fetch_add(delta_out, Ordering::Relaxed);
        }
        self.requests_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> TunnelStats {
        let inner = self.inner.lock();
        TunnelStats {
            id: self.id,
            subdomain: self.subdomain.clone(),
            protocol: self.protocol,
            status: inner.status,
            port: inner.port,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            requests_count: self.requests_count.load(Ordering::Relaxed),
            connected_at: self.connected_at,
            last_activity: inner.last_activity,
        }
    }

    /// Alias for [`Tunnel::get_stats`] — the name the periodic stats flush
    /// and admin surface reach for (SPEC_FULL §3 supplement).
    pub fn snapshot(&self) -> TunnelStats {
        self.get_stats()
    }

    /// Enqueues a request frame on this tunnel's writer queue. Blocks
    /// (bounded channel) while the queue is full, up to
    /// `REQUEST_QUEUE_SEND_TIMEOUT`, then fails with `DeadlineExceeded`
    /// (spec.md §5 "Backpressure"); returns `Unavailable` if the tunnel has
    /// already been closed.
    pub async fn enqueue_request(&self, frame: RequestFrame) -> Result<(), EdgeError> {
        let tx = {
            let inner = self.inner.lock();
            inner
                .request_tx
                .clone()
                .ok_or_else(|| EdgeError::Unavailable("tunnel is not active".into()))?
        };
        match tokio::time::timeout(REQUEST_QUEUE_SEND_TIMEOUT, tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EdgeError::Unavailable("tunnel writer has shut down".into())),
            Err(_) => Err(EdgeError::DeadlineExceeded(
                "request queue is full; tunnel is not keeping up".into(),
            )),
        }
    }

    /// Registers a response mailbox for a pending request, returning the
    /// receiving half. Delivery into this mailbox MUST block — dropping a
    /// chunk would corrupt a chunked transfer (spec.md §4.6, §5).
    pub fn register_pending(
        &self,
        request_id: Uuid,
        kind: MailboxKind,
        capacity: usize,
    ) -> mpsc::Receiver<MailboxMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        self.inner.lock().pending.insert((request_id, kind), tx);
        rx
    }

    pub fn remove_pending(&self, request_id: Uuid, kind: MailboxKind) {
        self.inner.lock().pending.remove(&(request_id, kind));
    }

    /// Delivers one message to the pending mailbox for `(request_id,
    /// kind)`. Returns `false` if no such mailbox is registered — the
    /// caller logs and discards (spec.md §8: "or the frame is discarded
    /// with a warning — never delivered to another request").
    pub async fn deliver(&self, request_id: Uuid, kind: MailboxKind, msg: MailboxMessage) -> bool {
        let tx = {
            let inner = self.inner.lock();
            match inner.pending.get(&(request_id, kind)) {
                Some(tx) => tx.clone(),
                None => return false,
            }
        };
        tx.send(msg).await.is_ok()
    }

    /// Delivers a response or error frame without the caller knowing which
    /// mailbox kind is still registered for `request_id` — a given request
    /// only ever has one kind live at a time (the HTTP mailbox is swapped
    /// for a WebSocket one exactly once, on a successful upgrade; a TCP
    /// connection only ever registers `Tcp`). Returns `false` if none of the
    /// kinds are registered (spec.md §8: discard with a warning).
    pub async fn deliver_response(&self, request_id: Uuid, msg: MailboxMessage) -> bool {
        for kind in ALL_MAILBOX_KINDS {
            if self.deliver(request_id, kind, msg.clone()).await {
                return true;
            }
        }
        false
    }

    /// Closes the tunnel: transitions to `Closed`, closes the request
    /// queue, and drains the pending-response map (dropping each sender
    /// closes its receiver). Idempotent — a second call is a no-op because
    /// `request_tx` is already `None` and `pending` already empty.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.status = TunnelStatus::Closed;
        inner.request_tx = None;
        inner.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Arc<Tunnel> {
        let (tunnel, _rx) = Tunnel::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            "myapp".into(),
            TunnelProtocol::Http,
            "localhost:3000".into(),
            "http://myapp.example.com".into(),
            None,
            None,
            1_000,
            0,
            0,
            0,
        );
        tunnel
    }

    #[test]
    fn stats_are_monotonic_and_reflect_seeded_totals() {
        let tunnel = sample();
        tunnel.update_stats(10, 20);
        tunnel.update_stats(5, 0);
        let stats = tunnel.get_stats();
        assert_eq!(stats.bytes_in, 15);
        assert_eq!(stats.bytes_out, 20);
        assert_eq!(stats.requests_count, 2);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drains_pending() {
        let tunnel = sample();
        let request_id = Uuid::new_v4();
        let mut rx = tunnel.register_pending(request_id, MailboxKind::Http, 4);
        tunnel.close();
        tunnel.close();
        assert_eq!(tunnel.status(), TunnelStatus::Closed);
        assert!(rx.recv().await.is_none());
        assert!(tunnel
            .enqueue_request(RequestFrame {
                request_id,
                tunnel_id: tunnel.id,
                payload: tunnel_protocol::Payload::Tcp(tunnel_protocol::TcpChunk {
                    bytes: vec![],
                    sequence: 0,
                }),
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn deliver_reports_missing_mailbox() {
        let tunnel = sample();
        let delivered = tunnel
            .deliver(
                Uuid::new_v4(),
                MailboxKind::Http,
                MailboxMessage::Error(ErrorFrame {
                    request_id: Uuid::new_v4(),
                    code: tunnel_protocol::ErrorCode::Internal,
                    message: "x".into(),
                }),
            )
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn deliver_response_falls_back_from_http_to_websocket_kind() {
        let tunnel = sample();
        let request_id = Uuid::new_v4();
        let mut ws_rx = tunnel.register_pending(request_id, MailboxKind::WebSocket, 4);
        let msg = MailboxMessage::Error(ErrorFrame {
            request_id,
            code: tunnel_protocol::ErrorCode::Internal,
            message: "x".into(),
        });
        assert!(tunnel.deliver_response(request_id, msg).await);
        assert!(ws_rx.recv().await.is_some());
    }
}
