use std::{error, fmt, io};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod cells;
pub mod frames;

/// Version byte carried by every framed struct. A mismatch on either side
/// causes a zero handshake and disconnect.
pub const WIRE_VERSION: u8 = 1;

/// A 32-bit little-endian acknowledgement exchanged between every frame, in
/// both the intake and the result-send protocols. Non-zero means proceed.
pub const HANDSHAKE_LEN: usize = 4;

pub async fn send_handshake<W>(w: &mut W, accept: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let hs: u32 = accept.into();
    w.write_all(&hs.to_le_bytes()).await?;
    w.flush().await
}

pub async fn recv_handshake<R>(r: &mut R) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    r.read_exact(&mut buf).await?;
    Ok(u32::from_le_bytes(buf) != 0)
}

/// As [`recv_handshake`], but a zero handshake becomes [`Error::Rejected`].
pub async fn expect_handshake<R>(r: &mut R) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    if recv_handshake(r).await? {
        Ok(())
    } else {
        Err(Error::Rejected)
    }
}

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    /// The frame's version byte doesn't match [`WIRE_VERSION`].
    Version(u8),
    /// Fewer bytes than the fixed frame size.
    Truncated,
    /// An out-of-range status byte in a host frame.
    BadStatus(u8),
    /// The remote answered a frame with a zero handshake.
    Rejected,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);

        send_handshake(&mut a, true).await.unwrap();
        send_handshake(&mut a, false).await.unwrap();

        assert!(recv_handshake(&mut b).await.unwrap());
        assert!(!recv_handshake(&mut b).await.unwrap());
    }

    #[tokio::test]
    async fn test_expect_handshake_rejects_zero() {
        let (mut a, mut b) = tokio::io::duplex(64);

        send_handshake(&mut a, false).await.unwrap();

        assert!(matches!(
            expect_handshake(&mut b).await,
            Err(Error::Rejected)
        ));
    }
}
