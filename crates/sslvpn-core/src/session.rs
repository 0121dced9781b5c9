//! Client sessions as seen by the tunnel data-plane.
//!
//! The data-plane does not know how packets reach the client (CSTP over TLS,
//! DTLS, ...). It only needs a session's addressing, a queue of packets to
//! write into the kernel, a close signal, and a way to hand packets read from
//! the kernel back to the transport. [`TunnelSession`] and
//! [`OutboundDispatch`] are those two seams; [`ConnSession`] and
//! [`SessionOutbound`] implement them over in-process queues, for a
//! transport that runs in the same process.

use crate::buffer::{Payload, PayloadPool};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connected client, from the data-plane's point of view.
pub trait TunnelSession: Send + Sync + 'static {
    /// Address assigned to the client.
    fn ip_addr(&self) -> Ipv4Addr;

    /// Negotiated MTU.
    fn mtu(&self) -> u16;

    /// Group the user logged in with.
    fn group(&self) -> &str;

    /// Login name.
    fn username(&self) -> &str;

    /// Record the name of the interface serving this session.
    fn set_if_name(&self, name: &str);

    /// Take the queue of packets to write into the kernel.
    ///
    /// Returns `None` once taken.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Payload>>;

    /// Signal cancelled when the session closes.
    fn close_signal(&self) -> &CancellationToken;

    /// Close the session. Must be idempotent.
    fn close(&self);
}

/// Hands a packet read from the kernel to the client transport.
pub trait OutboundDispatch<S: TunnelSession>: Send + Sync + 'static {
    /// Deliver `payload` to `session`.
    ///
    /// Returns `true` when the read loop should stop.
    fn dispatch(&self, session: &S, payload: Payload) -> impl Future<Output = bool> + Send;
}

/// Identity and addressing of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub ip_addr: Ipv4Addr,
    pub mtu: u16,
    pub group: String,
    pub username: String,
}

/// In-process session backed by two bounded queues.
///
/// The transport pushes client packets with [`ConnSession::deliver`] and
/// drains packets for the client from the receiver returned by
/// [`ConnSession::take_outbound`].
pub struct ConnSession {
    info: SessionInfo,
    if_name: Mutex<Option<String>>,
    inbound_tx: mpsc::Sender<Payload>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Payload>>>,
    outbound_tx: mpsc::Sender<Payload>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Payload>>>,
    close: CancellationToken,
    closed: AtomicBool,
}

impl ConnSession {
    /// Create a session with queues of `queue_depth` packets each.
    pub fn new(info: SessionInfo, queue_depth: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_depth.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_depth.max(1));
        Self {
            info,
            if_name: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            close: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Session identity.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Name of the interface serving this session, once linked.
    pub fn if_name(&self) -> Option<String> {
        self.if_name.lock().ok().and_then(|name| name.clone())
    }

    /// Returns true once [`TunnelSession::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a client packet for the kernel.
    ///
    /// Hands the payload back if the session is closed.
    pub async fn deliver(&self, payload: Payload) -> Result<(), Payload> {
        if self.is_closed() {
            return Err(payload);
        }
        self.inbound_tx.send(payload).await.map_err(|e| e.0)
    }

    /// Take the queue of packets destined for the client.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Payload>> {
        self.outbound_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    async fn send_outbound(&self, payload: Payload) -> Result<(), Payload> {
        tokio::select! {
            biased;
            _ = self.close.cancelled() => Ok(()),
            sent = self.outbound_tx.send(payload) => sent.map_err(|e| e.0),
        }
    }
}

impl TunnelSession for ConnSession {
    fn ip_addr(&self) -> Ipv4Addr {
        self.info.ip_addr
    }

    fn mtu(&self) -> u16 {
        self.info.mtu
    }

    fn group(&self) -> &str {
        &self.info.group
    }

    fn username(&self) -> &str {
        &self.info.username
    }

    fn set_if_name(&self, name: &str) {
        if let Ok(mut if_name) = self.if_name.lock() {
            *if_name = Some(name.to_string());
        }
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Payload>> {
        self.inbound_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    fn close_signal(&self) -> &CancellationToken {
        &self.close
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!(
            "Session {}@{} ({}) closed",
            self.info.username,
            self.info.group,
            self.info.ip_addr
        );
        self.close.cancel();
    }
}

/// Dispatches kernel packets onto a [`ConnSession`]'s outbound queue.
#[derive(Debug, Clone)]
pub struct SessionOutbound {
    pool: Arc<PayloadPool>,
}

impl SessionOutbound {
    pub fn new(pool: Arc<PayloadPool>) -> Self {
        Self { pool }
    }
}

impl OutboundDispatch<ConnSession> for SessionOutbound {
    async fn dispatch(&self, session: &ConnSession, payload: Payload) -> bool {
        if session.is_closed() {
            self.pool.release(payload);
            return true;
        }
        match session.send_outbound(payload).await {
            Ok(()) => session.is_closed(),
            Err(payload) => {
                self.pool.release(payload);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SessionInfo {
        SessionInfo {
            ip_addr: Ipv4Addr::new(10, 8, 0, 5),
            mtu: 1399,
            group: "ops".into(),
            username: "alice".into(),
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let session = ConnSession::new(info(), 4);
        assert!(!session.is_closed());
        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(session.close_signal().is_cancelled());
    }

    #[test]
    fn test_queues_can_be_taken_once() {
        let session = ConnSession::new(info(), 4);
        assert!(session.take_inbound().is_some());
        assert!(session.take_inbound().is_none());
        assert!(session.take_outbound().is_some());
        assert!(session.take_outbound().is_none());
    }

    #[test]
    fn test_if_name_recorded() {
        let session = ConnSession::new(info(), 4);
        assert_eq!(session.if_name(), None);
        session.set_if_name("tun3");
        assert_eq!(session.if_name().as_deref(), Some("tun3"));
    }

    #[tokio::test]
    async fn test_deliver_reaches_inbound_queue() {
        let pool = PayloadPool::new(64, 4);
        let session = ConnSession::new(info(), 4);
        let mut inbound = session.take_inbound().unwrap();

        let mut pl = pool.acquire();
        pl.fill_from(&[1, 2, 3]);
        session.deliver(pl).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().as_bytes(), &[1, 2, 3]);

        session.close();
        assert!(session.deliver(pool.acquire()).await.is_err());
    }

    #[tokio::test]
    async fn test_outbound_dispatch_forwards_until_closed() {
        let pool = Arc::new(PayloadPool::new(64, 4));
        let dispatch = SessionOutbound::new(pool.clone());
        let session = ConnSession::new(info(), 4);
        let mut outbound = session.take_outbound().unwrap();

        let mut pl = pool.acquire();
        pl.fill_from(&[9; 40]);
        assert!(!dispatch.dispatch(&session, pl).await);
        assert_eq!(outbound.recv().await.unwrap().len(), 40);

        session.close();
        assert!(dispatch.dispatch(&session, pool.acquire()).await);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_outbound_dispatch_stops_when_receiver_dropped() {
        let pool = Arc::new(PayloadPool::new(64, 4));
        let dispatch = SessionOutbound::new(pool.clone());
        let session = ConnSession::new(info(), 4);
        drop(session.take_outbound());

        assert!(dispatch.dispatch(&session, pool.acquire()).await);
        assert_eq!(pool.idle(), 1);
    }
}
