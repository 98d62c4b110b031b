use super::job::CurrentJob;

/// Advertised resource value meaning "no limit".
pub const INFINITE: u64 = u64::MAX;

/// What a peer is currently willing to do.
///
/// A slave only accepts new jobs while `Idle`. `Zombie` is the parking state
/// entered after an engine start failure, during which the slave refuses work
/// until the recovery timeout elapses.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Status {
    #[default]
    Idle,
    Busy,
    Zombie,
}

impl Status {
    pub fn as_wire(self) -> u8 {
        match self {
            Status::Idle => 0,
            Status::Busy => 1,
            Status::Zombie => 2,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Status::Idle),
            1 => Some(Status::Busy),
            2 => Some(Status::Zombie),
            _ => None,
        }
    }
}

/// A node's self-description: broadcast in every announcement and prefixed to
/// every outbound protocol exchange.
///
/// Identity strings are truncated to [`crate::wire::frames::STR_LEN`] bytes on
/// the wire; `socket` to [`crate::wire::frames::PATH_LEN`]. An empty `socket`
/// means the node offers no local (UDS) transport.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostDescriptor {
    pub id: u64,
    pub name: String,
    pub user: String,
    pub group: String,
    pub port: u16,
    pub socket: String,
    pub memavail: u64,
    pub cpuavail: u64,
    pub timavail: u64,
    pub status: Status,
    pub current: CurrentJob,
}

impl HostDescriptor {
    /// Peers are identified by the `(id, name)` pair: the id alone is only
    /// unique per boot of one supervisor.
    pub fn same_identity(&self, other: &HostDescriptor) -> bool {
        self.id == other.id && self.name == other.name
    }
}
