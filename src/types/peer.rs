use std::net::IpAddr;

use tokio::time::Instant;

use super::host::HostDescriptor;

/// An observed remote peer: a by-value snapshot of its last announcement.
///
/// `ipaddr` comes from the announce datagram's source address, not from the
/// descriptor itself, so results are mailed back to wherever the announce
/// actually came from.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub host: HostDescriptor,
    pub ipaddr: IpAddr,
    pub lastseen: Instant,
}
