//! The presence protocol: periodic UDP announce, discovery receiver, and the
//! peer-expiry sweeper.
//!
//! One announce task is the only sender of this host's descriptor, so
//! announcements are totally ordered per sender. Subsystems that mutate the
//! host descriptor request an immediate announce through [`AnnounceHandle`]
//! after releasing the host lock; receivers may briefly observe stale status
//! but never a torn descriptor.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::registry::Registry;
use crate::wire::frames;

/// Period of the steady-state announce beacon.
pub const ANNOUNCE_PERIOD: Duration = Duration::from_secs(1);
/// Period of the expiry sweeper.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);
/// A peer not heard from for this long is dropped.
pub const PEER_EXPIRY: Duration = Duration::from_secs(60);

/// Requests an immediate out-of-band announce from the announce task.
///
/// Cloned into every subsystem that changes peer-visible state. Kicks are
/// fire-and-forget: if the announce task is gone the process is shutting
/// down and the kick doesn't matter.
#[derive(Clone)]
pub struct AnnounceHandle {
    kick: mpsc::UnboundedSender<()>,
}

impl AnnounceHandle {
    pub fn kick(&self) {
        let _ = self.kick.send(());
    }
}

pub fn announce_channel() -> (AnnounceHandle, mpsc::UnboundedReceiver<()>) {
    let (kick, rx) = mpsc::unbounded_channel();
    (AnnounceHandle { kick }, rx)
}

/// Binds the send-side announce socket (broadcast-capable, ephemeral port).
pub fn bind_announce() -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Binds the discovery receive socket.
///
/// Reuse flags are set so several slaves on one host can all listen on the
/// shared discovery port; when `listen` is a multicast group the socket joins
/// it on all interfaces.
pub fn bind_discover(listen: SocketAddr) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(unix)]
    sock.set_reuse_port(true)?;
    sock.set_nonblocking(true)?;

    // Broadcast and multicast destinations can't be bound directly; the
    // wildcard receives both.
    let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, listen.port()).into();
    sock.bind(&bind_addr.into())?;

    let sock = UdpSocket::from_std(sock.into())?;
    if let IpAddr::V4(group) = listen.ip() {
        if group.is_multicast() {
            sock.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        }
    }

    Ok(sock)
}

/// Serializes the current (policy-shaded) descriptor and sends one datagram
/// to each destination.
pub async fn announce_once(registry: &Registry, socket: &UdpSocket, dests: &[SocketAddr]) {
    let frame = frames::encode_host(&registry.advertised_host());

    for dest in dests {
        if let Err(error) = socket.send_to(&frame, dest).await {
            warn!(%error, %dest, "failed to send announce");
        }
    }
}

/// The announce task: a beacon every `period` plus an immediate send for
/// every kick.
pub async fn run_announce(
    registry: Arc<Registry>,
    socket: UdpSocket,
    dests: Vec<SocketAddr>,
    mut kicks: mpsc::UnboundedReceiver<()>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = time::interval(period);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            kick = kicks.recv() => {
                if kick.is_none() {
                    return;
                }
            },
            _ = cancel.cancelled() => return,
        }

        announce_once(&registry, &socket, &dests).await;
    }
}

/// The discovery task: receives announcements and maintains the peer table.
/// Malformed or short datagrams are dropped silently; our own announcements
/// are ignored by `(id, name)` identity.
pub async fn run_discover(registry: Arc<Registry>, socket: UdpSocket, cancel: CancellationToken) {
    let mut buf = [0u8; 2048];

    loop {
        let (n, src) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(x) => x,
                Err(error) => {
                    warn!(%error, "discovery receive failed");
                    continue;
                },
            },
            _ = cancel.cancelled() => return,
        };

        let host = match frames::decode_host(&buf[..n]) {
            Ok(h) => h,
            Err(error) => {
                trace!(%error, %src, "dropping malformed announce");
                continue;
            },
        };

        if host.same_identity(&registry.snapshot_host()) {
            continue;
        }

        trace!(peer.id = host.id, peer.name = %host.name, %src, "announce received");
        registry.upsert_peer(host, src.ip(), Instant::now());
    }
}

/// The expiry task: periodically drops peers not heard from within `expiry`.
pub async fn run_expire(
    registry: Arc<Registry>,
    period: Duration,
    expiry: Duration,
    cancel: CancellationToken,
) {
    let mut tick = time::interval(period);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = cancel.cancelled() => return,
        }

        let evicted = registry.sweep_peers(Instant::now(), expiry);
        if evicted > 0 {
            debug!(evicted, remaining = registry.peer_count(), "expired peers");
        }
    }
}
