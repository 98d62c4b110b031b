//! The result-send protocol: the client side of the same framed exchange the
//! intake server runs, used to mail evaluation results back to the master.
//!
//! Failures here are surfaced by silent abort: the master notices through its
//! own watchdog timeout. Sockets and buffers are released on every exit path
//! by ordinary scope unwinding.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::types::host::HostDescriptor;
use crate::types::job::JobDef;
use crate::wire::{self, frames};

/// Where a result transfer should connect to.
#[derive(Clone, Debug)]
pub enum Target {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Uds(std::path::PathBuf),
}

/// Connects to the master and runs the result-send exchange.
pub async fn send_result(
    target: &Target,
    me: &HostDescriptor,
    def: &JobDef,
    arg: &[u8],
    opt: &[u8],
) -> Result<(), wire::Error> {
    debug!(?target, job.id = def.id, "returning results");

    match target {
        Target::Tcp(addr) => {
            let mut stream = TcpStream::connect(addr).await?;
            send_over(&mut stream, me, def, arg, opt).await
        },
        #[cfg(unix)]
        Target::Uds(path) => {
            let mut stream = UnixStream::connect(path).await?;
            send_over(&mut stream, me, def, arg, opt).await
        },
    }
}

/// The transfer proper: read the initial handshake, then alternate writing a
/// frame and reading its acknowledgement. Any zero handshake or transport
/// error aborts the remainder.
pub async fn send_over<S>(
    stream: &mut S,
    me: &HostDescriptor,
    def: &JobDef,
    arg: &[u8],
    opt: &[u8],
) -> Result<(), wire::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    wire::expect_handshake(stream).await?;

    stream.write_all(&frames::encode_host(me)).await?;
    wire::expect_handshake(stream).await?;

    stream.write_all(&frames::encode_jobdef(def)).await?;
    wire::expect_handshake(stream).await?;

    stream.write_all(arg).await?;
    wire::expect_handshake(stream).await?;

    stream.write_all(opt).await?;
    wire::expect_handshake(stream).await?;

    Ok(())
}
