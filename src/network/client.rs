//! Network Client
//!
//! TCP connection from a process to a remote coordinator.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{is_eof, read_frame, write_frame, Channel};
use crate::error::{Error, Result};
use crate::protocol::{FromCoordinator, ToCoordinator};

/// Connect to a coordinator and wrap the stream in a `Channel`.
///
/// Two tasks pump frames in each direction; the channel closes when
/// the coordinator goes away.
pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Channel> {
    let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
    };
    stream.set_nodelay(true)?;
    tracing::debug!("Connected to coordinator at {}", address);

    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<ToCoordinator>();
    let (inbound, rx) = mpsc::unbounded_channel::<FromCoordinator>();

    let peer = address.to_string();
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                tracing::warn!("Write to coordinator {} failed: {}", peer, e);
                break;
            }
        }
    });

    let peer = address.to_string();
    tokio::spawn(async move {
        loop {
            match read_frame::<_, FromCoordinator>(&mut reader).await {
                Ok(message) => {
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
                Err(e) if is_eof(&e) => {
                    tracing::info!("Coordinator {} closed the connection", peer);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Error reading from coordinator {}: {}", peer, e);
                    break;
                }
            }
        }
    });

    Ok(Channel { tx, rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect(&address, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
    }
}
