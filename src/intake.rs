//! The job intake server: a handshake-driven multi-stage transfer protocol
//! over TCP and (on unix) UDS, terminating in a queue entry.
//!
//! The intake side never touches the engine; its only product is a
//! [`JobEntry`]. Any short read, failed handshake, or policy denial tears the
//! connection down and discards whatever was read so far.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::types::host::{HostDescriptor, Status};
use crate::types::job::{JobDef, JobEntry};
use crate::wire::{self, frames};

/// Per-listener limits, snapshotted from the configuration at startup.
#[derive(Copy, Clone, Debug)]
pub struct IntakeLimits {
    /// Upper bound on each of `argsize` and `optsize`.
    pub max_job_size: u32,
}

/// Accepts TCP connections until cancelled, handling each on its own task.
pub async fn run_tcp(
    registry: Arc<Registry>,
    listener: TcpListener,
    limits: IntakeLimits,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "job intake listening");

    loop {
        match tokio::select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, peer)) => {
                let registry = registry.clone();
                let cancel = cancel.clone();
                if let Err(error) = conn.set_nodelay(true) {
                    warn!(%error, "setting NODELAY");
                }
                tokio::spawn(async move {
                    tokio::select! {
                        r = handle_conn(registry, conn, limits) => {
                            if let Err(error) = r {
                                warn!(%error, %peer, "intake failed");
                            }
                        },
                        _ = cancel.cancelled() => {},
                    }
                });
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

/// As [`run_tcp`], over the local-only socket.
#[cfg(unix)]
pub async fn run_uds(
    registry: Arc<Registry>,
    listener: UnixListener,
    limits: IntakeLimits,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr()?, "local job intake listening");

    loop {
        match tokio::select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                let registry = registry.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        r = handle_conn(registry, conn, limits) => {
                            if let Err(error) = r {
                                warn!(%error, "local intake failed");
                            }
                        },
                        _ = cancel.cancelled() => {},
                    }
                });
            },
            Err(error) => {
                warn!(%error, "failed to accept local connection");
                continue;
            },
        };
    }
}

/// Why an otherwise well-formed submission was turned away.
#[derive(Debug, Eq, PartialEq)]
enum Denial {
    NotIdle(Status),
    AccessList,
    ShareBackoff,
    Oversized { argsize: u32, optsize: u32 },
    Resources,
}

/// Runs the server side of the intake state machine on one connection.
///
/// Sequence: handshake, host frame, handshake, jobdef frame, handshake, arg
/// bytes, handshake, opt bytes, handshake, enqueue. A job enters the queue
/// iff every handshake was positive and every declared byte arrived.
pub async fn handle_conn<S>(
    registry: Arc<Registry>,
    mut stream: S,
    limits: IntakeLimits,
) -> Result<(), wire::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    wire::send_handshake(&mut stream, true).await?;

    // submitter descriptor
    let mut buf = vec![0u8; frames::HOST_WIRE_LEN];
    stream.read_exact(&mut buf).await?;
    let submitter = match frames::decode_host(&buf) {
        Ok(h) => h,
        Err(error) => {
            wire::send_handshake(&mut stream, false).await?;
            return Err(error);
        },
    };

    if let Some(denial) = vet_submitter(&registry, &submitter) {
        info!(submitter.id, user = %submitter.user, ?denial, "job refused");
        wire::send_handshake(&mut stream, false).await?;
        return Ok(());
    }
    wire::send_handshake(&mut stream, true).await?;

    // job definition
    let mut buf = vec![0u8; frames::JOBDEF_WIRE_LEN];
    stream.read_exact(&mut buf).await?;
    let def = match frames::decode_jobdef(&buf) {
        Ok(d) => d,
        Err(error) => {
            wire::send_handshake(&mut stream, false).await?;
            return Err(error);
        },
    };

    if let Some(denial) = vet_jobdef(&registry, &def, limits) {
        info!(job.id = def.id, ?denial, "job refused");
        wire::send_handshake(&mut stream, false).await?;
        return Ok(());
    }
    wire::send_handshake(&mut stream, true).await?;

    // payloads, exactly as declared
    let arg = read_blob(&mut stream, def.argsize as usize).await?;
    wire::send_handshake(&mut stream, true).await?;

    let opt = read_blob(&mut stream, def.optsize as usize).await?;
    wire::send_handshake(&mut stream, true).await?;

    debug!(
        job.id = def.id,
        submitter.id,
        argsize = def.argsize,
        optsize = def.optsize,
        "job accepted"
    );
    registry.note_accepted(submitter.id, Instant::now());
    registry.enqueue_job(JobEntry {
        host: submitter,
        def,
        arg,
        opt,
    });

    Ok(())
}

fn vet_submitter(registry: &Registry, submitter: &HostDescriptor) -> Option<Denial> {
    let status = registry.status();
    if status != Status::Idle {
        return Some(Denial::NotIdle(status));
    }
    if !registry.access_allows(submitter) {
        return Some(Denial::AccessList);
    }
    if !registry.smartshare_permits(submitter.id, Instant::now()) {
        return Some(Denial::ShareBackoff);
    }
    None
}

fn vet_jobdef(registry: &Registry, def: &JobDef, limits: IntakeLimits) -> Option<Denial> {
    if def.argsize > limits.max_job_size || def.optsize > limits.max_job_size {
        return Some(Denial::Oversized {
            argsize: def.argsize,
            optsize: def.optsize,
        });
    }

    let host = registry.snapshot_host();
    let payload = def.argsize as u64 + def.optsize as u64;
    if def.memreq > host.memavail
        || def.cpureq > host.cpuavail
        || def.timreq > host.timavail
        || payload > host.memavail
    {
        return Some(Denial::Resources);
    }

    None
}

async fn read_blob<S>(stream: &mut S, len: usize) -> Result<Bytes, wire::Error>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(len);
    stream.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

/// Binds the TCP intake listener and records the assigned port in the host
/// descriptor.
pub async fn bind_tcp(registry: &Registry, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .context("binding job intake listener")?;
    let port = listener.local_addr()?.port();
    registry.update_host(|h| h.port = port);
    Ok(listener)
}

/// Binds the UDS intake listener, replacing any stale socket file, and
/// records the path in the host descriptor.
#[cfg(unix)]
pub fn bind_uds(registry: &Registry, path: &std::path::Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e).context("removing stale socket file"),
    }

    let listener = UnixListener::bind(path).context("binding local intake listener")?;
    registry.update_host(|h| h.socket = path.to_string_lossy().into_owned());
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::types::host::INFINITE;
    use crate::types::policy::{AccessLists, SmartPolicies};
    use crate::wire::WIRE_VERSION;

    fn test_registry(access: AccessLists) -> Arc<Registry> {
        Arc::new(Registry::new(
            HostDescriptor {
                id: 1,
                name: "slave".into(),
                memavail: 1 << 20,
                cpuavail: INFINITE,
                timavail: INFINITE,
                ..Default::default()
            },
            access,
            SmartPolicies::default(),
        ))
    }

    fn submitter() -> HostDescriptor {
        HostDescriptor {
            id: 42,
            name: "master".into(),
            user: "alice".into(),
            group: "lab".into(),
            port: 7001,
            ..Default::default()
        }
    }

    fn jobdef(id: u64, argsize: u32, optsize: u32) -> JobDef {
        JobDef {
            version: WIRE_VERSION,
            id,
            memreq: 1024,
            cpureq: 1,
            timreq: 10,
            argsize,
            optsize,
        }
    }

    const LIMITS: IntakeLimits = IntakeLimits {
        max_job_size: 1 << 16,
    };

    async fn expect_hs(stream: &mut (impl AsyncRead + Unpin), want: bool) {
        assert_eq!(wire::recv_handshake(stream).await.unwrap(), want);
    }

    #[tokio::test]
    async fn test_happy_path_enqueues_exact_blobs() {
        let reg = test_registry(AccessLists::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_conn(reg.clone(), server, LIMITS));

        expect_hs(&mut client, true).await;

        client
            .write_all(&frames::encode_host(&submitter()))
            .await
            .unwrap();
        expect_hs(&mut client, true).await;

        client
            .write_all(&frames::encode_jobdef(&jobdef(7, 8, 4)))
            .await
            .unwrap();
        expect_hs(&mut client, true).await;

        client.write_all(b"\x01\x02\x03\x04\x05\x06\x07\x08").await.unwrap();
        expect_hs(&mut client, true).await;

        client.write_all(b"opts").await.unwrap();
        expect_hs(&mut client, true).await;

        task.await.unwrap().unwrap();

        let job = reg.pop_job().expect("job should be queued");
        assert_eq!(job.def.id, 7);
        assert_eq!(job.host.id, 42);
        assert_eq!(job.arg.as_ref(), b"\x01\x02\x03\x04\x05\x06\x07\x08");
        assert_eq!(job.opt.as_ref(), b"opts");
        assert_eq!(job.arg.len(), job.def.argsize as usize);
        assert_eq!(job.opt.len(), job.def.optsize as usize);
    }

    #[tokio::test]
    async fn test_access_denial_closes_after_host_frame() {
        let reg = test_registry(AccessLists::from_lists(&["bob".into()], &[], &[]));
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_conn(reg.clone(), server, LIMITS));

        expect_hs(&mut client, true).await;

        // submitter user is alice; only bob is allowed
        client
            .write_all(&frames::encode_host(&submitter()))
            .await
            .unwrap();
        expect_hs(&mut client, false).await;

        task.await.unwrap().unwrap();
        assert!(reg.pop_job().is_none());
    }

    #[tokio::test]
    async fn test_busy_slave_refuses() {
        let reg = test_registry(AccessLists::default());
        reg.update_host(|h| h.status = Status::Busy);

        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_conn(reg.clone(), server, LIMITS));

        expect_hs(&mut client, true).await;
        client
            .write_all(&frames::encode_host(&submitter()))
            .await
            .unwrap();
        expect_hs(&mut client, false).await;

        task.await.unwrap().unwrap();
        assert!(reg.pop_job().is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let reg = test_registry(AccessLists::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_conn(reg.clone(), server, LIMITS));

        expect_hs(&mut client, true).await;
        client
            .write_all(&frames::encode_host(&submitter()))
            .await
            .unwrap();
        expect_hs(&mut client, true).await;

        let mut bad = BytesMut::from(frames::encode_jobdef(&jobdef(1, 4, 0)).as_ref());
        bad[0] = WIRE_VERSION + 1;
        client.write_all(&bad).await.unwrap();
        expect_hs(&mut client, false).await;

        assert!(matches!(
            task.await.unwrap(),
            Err(wire::Error::Version(_))
        ));
        assert!(reg.pop_job().is_none());
    }

    #[tokio::test]
    async fn test_oversized_job_refused() {
        let reg = test_registry(AccessLists::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_conn(reg.clone(), server, LIMITS));

        expect_hs(&mut client, true).await;
        client
            .write_all(&frames::encode_host(&submitter()))
            .await
            .unwrap();
        expect_hs(&mut client, true).await;

        client
            .write_all(&frames::encode_jobdef(&jobdef(1, LIMITS.max_job_size + 1, 0)))
            .await
            .unwrap();
        expect_hs(&mut client, false).await;

        task.await.unwrap().unwrap();
        assert!(reg.pop_job().is_none());
    }

    #[tokio::test]
    async fn test_short_stream_enqueues_nothing() {
        let reg = test_registry(AccessLists::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_conn(reg.clone(), server, LIMITS));

        expect_hs(&mut client, true).await;
        client
            .write_all(&frames::encode_host(&submitter()))
            .await
            .unwrap();
        expect_hs(&mut client, true).await;
        client
            .write_all(&frames::encode_jobdef(&jobdef(1, 8, 0)))
            .await
            .unwrap();
        expect_hs(&mut client, true).await;

        // three bytes short of the declared argsize
        client.write_all(b"\x01\x02\x03\x04\x05").await.unwrap();
        drop(client);

        assert!(matches!(task.await.unwrap(), Err(wire::Error::IO(_))));
        assert!(reg.pop_job().is_none());
    }
}
