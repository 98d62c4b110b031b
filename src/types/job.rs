use bytes::Bytes;

use super::host::HostDescriptor;

/// What a node is working on right now. Zeroed while idle.
///
/// Embedded in every [`HostDescriptor`], so other peers can see who a busy
/// slave is serving.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CurrentJob {
    /// Originating peer id (the master).
    pub hostid: u64,
    pub jobid: u64,
    pub memreq: u64,
    pub cpureq: u64,
    pub timreq: u64,
    /// Originator identity, copied from the submitting descriptor.
    pub name: String,
    pub user: String,
    pub group: String,
}

impl CurrentJob {
    pub fn is_none(&self) -> bool {
        *self == CurrentJob::default()
    }
}

/// The fixed-size header describing one job.
///
/// Sent by the master during intake and echoed (with resource fields zeroed
/// and the sizes replaced by the result sizes) when the slave mails results
/// back.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobDef {
    pub version: u8,
    pub id: u64,
    pub memreq: u64,
    pub cpureq: u64,
    pub timreq: u64,
    pub argsize: u32,
    pub optsize: u32,
}

impl JobDef {
    /// Builds the header for a result transfer: same job id, resource fields
    /// zeroed, sizes describing the serialized results.
    pub fn result_for(jobid: u64, argsize: u32, optsize: u32) -> Self {
        JobDef {
            version: crate::wire::WIRE_VERSION,
            id: jobid,
            memreq: 0,
            cpureq: 0,
            timreq: 0,
            argsize,
            optsize,
        }
    }
}

/// One accepted job, queued FIFO until the slave loop picks it up.
///
/// `arg` and `opt` are opaque engine-format blobs whose lengths are exactly
/// `def.argsize` and `def.optsize`; the intake server enforces that before an
/// entry is ever constructed.
#[derive(Clone, Debug)]
pub struct JobEntry {
    /// The submitter's descriptor as presented during intake.
    pub host: HostDescriptor,
    pub def: JobDef,
    pub arg: Bytes,
    pub opt: Bytes,
}
