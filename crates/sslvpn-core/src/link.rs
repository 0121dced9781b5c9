//! Per-session TUN links and the packet forwarding loops.
//!
//! [`LinkManager::link_tun`] gives a session its own point-to-point TUN
//! interface (gateway address on the local end, client address as the peer)
//! and spawns two tasks:
//!
//! - the write loop drains the session's inbound queue into the device;
//! - the read loop reads packets from the device and hands them to an
//!   [`OutboundDispatch`].
//!
//! Either loop ending closes the link. The write loop owns session teardown:
//! whichever way it exits (session closed, write failure, link closed by the
//! read loop), it closes the session exactly once.

use crate::buffer::{Payload, PayloadPool};
use crate::command::{args, run_checked, CommandRunner};
use crate::device::{TunDevice, TunProvider};
use crate::error::{GatewayError, GatewayResult};
use crate::session::{OutboundDispatch, TunnelSession};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// MTU used for the startup diagnostic device.
pub const CHECK_MTU: u16 = 1399;

/// Longest interface alias accepted by the kernel (IFALIASZ - 1).
pub const MAX_ALIAS_LEN: usize = 255;

/// An open per-session interface.
///
/// Closing is idempotent; the device itself is released when both loops have
/// dropped their halves.
#[derive(Debug)]
pub struct TunLink {
    name: String,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl TunLink {
    fn new(name: String) -> Self {
        Self {
            name,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the link. Returns true for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        log::debug!("Closing link {}", self.name);
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the link is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Handle to a linked session's interface and forwarding tasks.
pub struct LinkHandle {
    link: Arc<TunLink>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl LinkHandle {
    /// Interface name.
    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn link(&self) -> &Arc<TunLink> {
        &self.link
    }

    /// Close the link; both loops exit and the session is closed.
    pub fn close(&self) -> bool {
        self.link.close()
    }

    /// Wait for both forwarding tasks to finish.
    pub async fn join(self) {
        for (label, task) in [("read", self.read_task), ("write", self.write_task)] {
            if let Err(e) = task.await {
                log::error!("{} loop of {} panicked: {}", label, self.link.name(), e);
            }
        }
    }
}

/// Creates and configures per-session TUN interfaces.
pub struct LinkManager<P, R> {
    provider: P,
    runner: Arc<R>,
    gateway: Ipv4Addr,
    pool: Arc<PayloadPool>,
}

impl<P: TunProvider, R: CommandRunner> LinkManager<P, R> {
    /// `gateway` is the local address of every point-to-point link.
    pub fn new(provider: P, runner: Arc<R>, gateway: Ipv4Addr, pool: Arc<PayloadPool>) -> Self {
        Self {
            provider,
            runner,
            gateway,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<PayloadPool> {
        &self.pool
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    /// Open a throwaway device and bring it up, proving TUN support works.
    pub async fn check_tun(&self) -> GatewayResult<()> {
        let device = self.provider.open()?;
        let name = device.name().to_string();

        let result = run_checked(
            self.runner.as_ref(),
            "ip",
            &args([
                "link", "set", "dev", &name, "up", "mtu", &CHECK_MTU.to_string(), "multicast", "off",
            ]),
        )
        .await;
        drop(device);

        result.map_err(|e| {
            GatewayError::tun_device_with_source(format!("Failed to bring up {}", name), e)
        })?;
        log::info!("TUN check passed using {}", name);
        Ok(())
    }

    /// Attach `session` to a new TUN interface and start forwarding.
    ///
    /// On a configuration failure the device is closed and the error is
    /// returned; the session itself is left open for the caller to dispose
    /// of.
    pub async fn link_tun<S, D>(&self, session: Arc<S>, dispatch: Arc<D>) -> GatewayResult<LinkHandle>
    where
        S: TunnelSession,
        D: OutboundDispatch<S>,
    {
        let device = self.provider.open()?;
        let name = device.name().to_string();
        session.set_if_name(&name);

        let alias = link_alias(session.group(), session.username());
        let peer = format!("{}/32", session.ip_addr());
        let mtu = session.mtu().to_string();

        let link_up = args([
            "link", "set", "dev", &name, "up", "mtu", &mtu, "multicast", "off", "alias", &alias,
        ]);
        let addr_add = args([
            "addr",
            "add",
            "dev",
            &name,
            "local",
            &self.gateway.to_string(),
            "peer",
            &peer,
        ]);

        for cmd in [&link_up, &addr_add] {
            if let Err(e) = run_checked(self.runner.as_ref(), "ip", cmd).await {
                drop(device);
                return Err(GatewayError::tun_device_with_source(
                    format!("Failed to configure {} for {}", name, session.ip_addr()),
                    e,
                ));
            }
        }

        let disable_ipv6 = format!("net.ipv6.conf.{}.disable_ipv6=1", name);
        if let Err(e) = run_checked(self.runner.as_ref(), "sysctl", &args(["-w", &disable_ipv6])).await {
            log::warn!("Could not disable IPv6 on {}: {}", name, e);
        }

        let Some(inbound) = session.take_inbound() else {
            drop(device);
            return Err(GatewayError::Session(format!(
                "inbound queue of {} is already attached",
                session.ip_addr()
            )));
        };

        let (reader, writer) = device.split()?;
        let link = Arc::new(TunLink::new(name));

        log::info!(
            "Linked {}@{} ({}) to {} mtu {}",
            session.username(),
            session.group(),
            session.ip_addr(),
            link.name(),
            mtu
        );

        let write_task = tokio::spawn(write_loop(
            writer,
            inbound,
            session.clone(),
            link.clone(),
            self.pool.clone(),
        ));
        let read_task = tokio::spawn(read_loop(
            reader,
            session,
            dispatch,
            link.clone(),
            self.pool.clone(),
        ));

        Ok(LinkHandle {
            link,
            read_task,
            write_task,
        })
    }
}

/// Interface alias for a session: `group.username`, made safe for `ip`.
///
/// Whitespace, quotes, control characters and shell metacharacters become
/// '-'; the result is cut to the kernel's alias limit.
pub fn link_alias(group: &str, username: &str) -> String {
    let mut alias = String::with_capacity(group.len() + username.len() + 1);
    for c in group.chars().chain(std::iter::once('.')).chain(username.chars()) {
        let unsafe_char = c.is_whitespace()
            || c.is_control()
            || matches!(
                c,
                '"' | '\'' | '`' | '\\' | '$' | ';' | '&' | '|' | '<' | '>' | '(' | ')' | '{' | '}'
                    | '*' | '?' | '!' | '#' | '~'
            );
        let c = if unsafe_char { '-' } else { c };
        if alias.len() + c.len_utf8() > MAX_ALIAS_LEN {
            break;
        }
        alias.push(c);
    }
    alias
}

/// Drain the session's inbound queue into the device.
async fn write_loop<W, S>(
    mut writer: W,
    mut inbound: mpsc::Receiver<Payload>,
    session: Arc<S>,
    link: Arc<TunLink>,
    pool: Arc<PayloadPool>,
) where
    W: AsyncWrite + Unpin,
    S: TunnelSession,
{
    loop {
        let payload = tokio::select! {
            biased;
            _ = session.close_signal().cancelled() => {
                log::debug!("{}: session closed, stopping writer", link.name());
                break;
            }
            _ = link.closed() => break,
            next = inbound.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        let result = writer.write_all(payload.as_bytes()).await;
        pool.release(payload);
        if let Err(e) = result {
            log::error!("{}: write failed: {}", link.name(), e);
            break;
        }
    }

    link.close();
    session.close();
    log::debug!("{}: writer stopped", link.name());
}

/// Read packets from the device and hand them to the dispatcher.
async fn read_loop<Rd, S, D>(
    mut reader: Rd,
    session: Arc<S>,
    dispatch: Arc<D>,
    link: Arc<TunLink>,
    pool: Arc<PayloadPool>,
) where
    Rd: AsyncRead + Unpin,
    S: TunnelSession,
    D: OutboundDispatch<S>,
{
    loop {
        let mut payload = pool.acquire();
        let read = tokio::select! {
            biased;
            _ = link.closed() => None,
            read = reader.read(payload.buf_mut()) => Some(read),
        };

        let n = match read {
            Some(Ok(0)) => {
                log::debug!("{}: device closed", link.name());
                pool.release(payload);
                break;
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                log::error!("{}: read failed: {}", link.name(), e);
                pool.release(payload);
                break;
            }
            None => {
                pool.release(payload);
                break;
            }
        };

        payload.set_len(n);
        if dispatch.dispatch(&session, payload).await {
            break;
        }
    }

    link.close();
    log::debug!("{}: reader stopped", link.name());
}
