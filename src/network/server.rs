//! Network Server
//!
//! TCP server that lets processes on other hosts (or in other OS
//! processes) talk to the coordinator.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{is_eof, read_frame, write_frame};
use crate::coordinator::CoordinatorHandle;
use crate::error::Result;
use crate::protocol::{FromCoordinator, ToCoordinator};

/// TCP front end for a coordinator
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Coordinator receiving inbound messages
    coordinator: CoordinatorHandle,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, coordinator: CoordinatorHandle) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            coordinator,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the listener
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Coordinator listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let coordinator = self.coordinator.clone();
                            tokio::spawn(async move {
                                handle_connection(socket, addr, coordinator).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve one process connection
async fn handle_connection(socket: TcpStream, addr: SocketAddr, coordinator: CoordinatorHandle) {
    if let Err(e) = socket.set_nodelay(true) {
        tracing::debug!("set_nodelay failed for {}: {}", addr, e);
    }
    let (mut reader, mut writer) = socket.into_split();
    let (endpoint, mut outbound) = mpsc::unbounded_channel::<FromCoordinator>();

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                tracing::debug!("Write to {} failed: {}", addr, e);
                break;
            }
        }
    });

    tracing::debug!("Process connection from {}", addr);
    let mut registered: Option<String> = None;

    loop {
        match read_frame::<_, ToCoordinator>(&mut reader).await {
            Ok(message) => {
                match &message {
                    ToCoordinator::Register { process_id } => registered = Some(process_id.clone()),
                    ToCoordinator::Unregister { .. } => registered = None,
                    _ => {}
                }
                if coordinator.deliver(&endpoint, message).is_err() {
                    break;
                }
            }
            Err(e) if is_eof(&e) => break,
            Err(e) => {
                tracing::warn!("Error reading from {}: {}", addr, e);
                break;
            }
        }
    }

    // The stream ended without an orderly unregister
    if let Some(process_id) = registered {
        tracing::info!("Connection from {} ({}) closed", addr, process_id);
        let _ = coordinator.deliver(&endpoint, ToCoordinator::Unregister { process_id });
    }

    drop(endpoint);
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::Coordinator;
    use crate::network::connect;
    use std::sync::Arc;
    use std::time::Duration;

    async fn spawn_server() -> (CoordinatorHandle, Arc<NetworkServer>, String) {
        let handle = Coordinator::spawn(CoordinatorConfig {
            promotion_grace_ms: 10,
            ..CoordinatorConfig::default()
        });
        let server = Arc::new(NetworkServer::new("127.0.0.1:0".to_string(), handle.clone()));
        let listener = server.bind().await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        (handle, server, address)
    }

    #[tokio::test]
    async fn test_register_over_tcp_and_promote() {
        let (handle, server, address) = spawn_server().await;
        let mut channel = connect(&address, Duration::from_secs(2)).await.unwrap();

        channel
            .tx
            .send(ToCoordinator::Register { process_id: "remote-a".to_string() })
            .unwrap();

        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), channel.rx.recv())
                .await
                .unwrap()
                .unwrap();
            if message == (FromCoordinator::Promote { process_id: "remote-a".to_string() }) {
                break;
            }
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active_process_id.as_deref(), Some("remote-a"));
        server.stop();
    }

    #[tokio::test]
    async fn test_dropped_stream_unregisters() {
        let (handle, server, address) = spawn_server().await;
        let channel = connect(&address, Duration::from_secs(2)).await.unwrap();

        channel
            .tx
            .send(ToCoordinator::Register { process_id: "remote-b".to_string() })
            .unwrap();

        for _ in 0..100 {
            if handle.snapshot().await.unwrap().connections.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.snapshot().await.unwrap().connections.len(), 1);

        drop(channel);

        let mut remaining = 1;
        for _ in 0..200 {
            remaining = handle.snapshot().await.unwrap().connections.len();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 0);
        server.stop();
    }
}
