//! Fixed-size little-endian frame codecs.
//!
//! All three structs cross the wire as packed little-endian frames of a fixed
//! size, exchanged verbatim by prior agreement; there is no length prefix.
//! Identity strings are NUL-padded fixed-width fields and are truncated (not
//! rejected) when too long.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Error, WIRE_VERSION};
use crate::types::host::{HostDescriptor, Status};
use crate::types::job::{CurrentJob, JobDef};

/// Width of the `name`, `user`, and `group` fields.
pub const STR_LEN: usize = 64;
/// Width of the UDS path field (`sockaddr_un` limit).
pub const PATH_LEN: usize = 108;

/// On the wire: `hostid u64, jobid u64, memreq u64, cpureq u64, timreq u64,
/// name [64], user [64], group [64]`.
pub const CURRENT_WIRE_LEN: usize = 5 * 8 + 3 * STR_LEN;

/// On the wire: `version u8, status u8, port u16, id u64, memavail u64,
/// cpuavail u64, timavail u64, name [64], user [64], group [64],
/// socket [108], current [CURRENT_WIRE_LEN]`.
pub const HOST_WIRE_LEN: usize = 1 + 1 + 2 + 8 + 3 * 8 + 3 * STR_LEN + PATH_LEN + CURRENT_WIRE_LEN;

/// On the wire: `version u8, id u64, memreq u64, cpureq u64, timreq u64,
/// argsize u32, optsize u32`.
pub const JOBDEF_WIRE_LEN: usize = 1 + 4 * 8 + 2 * 4;

fn put_fixed_str(dst: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    dst.put_slice(&bytes[..n]);
    dst.put_bytes(0, width - n);
}

fn get_fixed_str(src: &mut &[u8], width: usize) -> String {
    // Panic safety: callers check the full frame length before any get_*.
    let field = &src[..width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    let s = String::from_utf8_lossy(&field[..end]).into_owned();
    src.advance(width);
    s
}

pub fn encode_host(host: &HostDescriptor) -> Bytes {
    let mut dst = BytesMut::with_capacity(HOST_WIRE_LEN);

    dst.put_u8(WIRE_VERSION);
    dst.put_u8(host.status.as_wire());
    dst.put_u16_le(host.port);
    dst.put_u64_le(host.id);
    dst.put_u64_le(host.memavail);
    dst.put_u64_le(host.cpuavail);
    dst.put_u64_le(host.timavail);
    put_fixed_str(&mut dst, &host.name, STR_LEN);
    put_fixed_str(&mut dst, &host.user, STR_LEN);
    put_fixed_str(&mut dst, &host.group, STR_LEN);
    put_fixed_str(&mut dst, &host.socket, PATH_LEN);
    put_current(&mut dst, &host.current);

    debug_assert_eq!(dst.len(), HOST_WIRE_LEN);
    dst.freeze()
}

pub fn decode_host(mut src: &[u8]) -> Result<HostDescriptor, Error> {
    if src.len() < HOST_WIRE_LEN {
        return Err(Error::Truncated);
    }

    let version = src.get_u8();
    if version != WIRE_VERSION {
        return Err(Error::Version(version));
    }

    let status_b = src.get_u8();
    let status = Status::from_wire(status_b).ok_or(Error::BadStatus(status_b))?;

    let port = src.get_u16_le();
    let id = src.get_u64_le();
    let memavail = src.get_u64_le();
    let cpuavail = src.get_u64_le();
    let timavail = src.get_u64_le();
    let name = get_fixed_str(&mut src, STR_LEN);
    let user = get_fixed_str(&mut src, STR_LEN);
    let group = get_fixed_str(&mut src, STR_LEN);
    let socket = get_fixed_str(&mut src, PATH_LEN);
    let current = get_current(&mut src);

    Ok(HostDescriptor {
        id,
        name,
        user,
        group,
        port,
        socket,
        memavail,
        cpuavail,
        timavail,
        status,
        current,
    })
}

fn put_current(dst: &mut BytesMut, cur: &CurrentJob) {
    dst.put_u64_le(cur.hostid);
    dst.put_u64_le(cur.jobid);
    dst.put_u64_le(cur.memreq);
    dst.put_u64_le(cur.cpureq);
    dst.put_u64_le(cur.timreq);
    put_fixed_str(dst, &cur.name, STR_LEN);
    put_fixed_str(dst, &cur.user, STR_LEN);
    put_fixed_str(dst, &cur.group, STR_LEN);
}

fn get_current(src: &mut &[u8]) -> CurrentJob {
    CurrentJob {
        hostid: src.get_u64_le(),
        jobid: src.get_u64_le(),
        memreq: src.get_u64_le(),
        cpureq: src.get_u64_le(),
        timreq: src.get_u64_le(),
        name: get_fixed_str(src, STR_LEN),
        user: get_fixed_str(src, STR_LEN),
        group: get_fixed_str(src, STR_LEN),
    }
}

pub fn encode_jobdef(def: &JobDef) -> Bytes {
    let mut dst = BytesMut::with_capacity(JOBDEF_WIRE_LEN);

    dst.put_u8(def.version);
    dst.put_u64_le(def.id);
    dst.put_u64_le(def.memreq);
    dst.put_u64_le(def.cpureq);
    dst.put_u64_le(def.timreq);
    dst.put_u32_le(def.argsize);
    dst.put_u32_le(def.optsize);

    debug_assert_eq!(dst.len(), JOBDEF_WIRE_LEN);
    dst.freeze()
}

pub fn decode_jobdef(mut src: &[u8]) -> Result<JobDef, Error> {
    if src.len() < JOBDEF_WIRE_LEN {
        return Err(Error::Truncated);
    }

    let version = src.get_u8();
    if version != WIRE_VERSION {
        return Err(Error::Version(version));
    }

    Ok(JobDef {
        version,
        id: src.get_u64_le(),
        memreq: src.get_u64_le(),
        cpureq: src.get_u64_le(),
        timreq: src.get_u64_le(),
        argsize: src.get_u32_le(),
        optsize: src.get_u32_le(),
    })
}
