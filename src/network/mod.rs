//! Network Module
//!
//! Carries coordination messages between processes and the coordinator,
//! either in-process or over TCP.

mod client;
mod server;

pub use client::connect;
pub use server::NetworkServer;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{self, FrameHeader, FromCoordinator, ToCoordinator};

/// A process's connection to the coordinator.
///
/// Messages on each side are delivered in order. The channel is closed
/// when `rx` yields `None`.
#[derive(Debug)]
pub struct Channel {
    pub tx: mpsc::UnboundedSender<ToCoordinator>,
    pub rx: mpsc::UnboundedReceiver<FromCoordinator>,
}

/// Read a framed message from a reader
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(protocol::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = protocol::serialize(message)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// True when a read failed because the peer closed the stream
pub(crate) fn is_eof(error: &Error) -> bool {
    matches!(error, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}
