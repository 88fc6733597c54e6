//! Listener that turns accepted connections into served `RpcStream`s.
//!
//! Binds a TCP address or a Unix socket path. Every accepted connection
//! is wrapped in an [`RpcStream`] answered by the shared handler and
//! handed to the owner through [`RpcServerHandle::accept`], which can
//! then call back into that peer.

use crate::handler::RpcHandler;
use crate::stream::RpcStream;
use crate::transport::{Address, BoxedReader, BoxedWriter};
use crate::{Result, RpcError};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Handle to a running server. Dropping shuts down the server.
pub struct RpcServerHandle {
    addr: Address,
    sessions: mpsc::UnboundedReceiver<RpcStream>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    /// The address the server is listening on.
    ///
    /// For TCP this carries the OS-assigned port when bound to port 0.
    pub fn addr(&self) -> &Address {
        &self.addr
    }

    /// Wait for the next accepted connection.
    ///
    /// Returns `None` once the server has shut down.
    pub async fn accept(&mut self) -> Option<RpcStream> {
        self.sessions.recv().await
    }

    /// Stop accepting new connections.
    ///
    /// Connections already handed out keep running until closed.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixSocket),
}

#[cfg(unix)]
struct UnixSocket {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl Drop for UnixSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Listener {
    async fn bind(address: &Address) -> Result<(Self, Address)> {
        match address {
            Address::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let local = Address::from(listener.local_addr()?);
                Ok((Listener::Tcp(listener), local))
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                let listener = tokio::net::UnixListener::bind(path)?;
                let socket = UnixSocket {
                    listener,
                    path: path.clone(),
                };
                Ok((Listener::Unix(socket), address.clone()))
            }
            #[cfg(not(unix))]
            Address::Unix(path) => Err(RpcError::InvalidAddress(format!(
                "Unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }

    async fn accept(&self) -> std::io::Result<(BoxedReader, BoxedWriter, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(socket) => {
                let (stream, _) = socket.listener.accept().await?;
                let (reader, writer) = stream.into_split();
                let peer = socket.path.display().to_string();
                Ok((Box::new(reader), Box::new(writer), peer))
            }
        }
    }
}

/// msgpack-rpc server that listens for peer connections.
pub struct RpcServer;

impl RpcServer {
    /// Bind `address` and start accepting connections.
    ///
    /// Bind to port 0 for an OS-assigned TCP port; the handle reports the
    /// actual address.
    pub async fn bind(address: &Address, handler: Arc<dyn RpcHandler>) -> Result<RpcServerHandle> {
        let (listener, addr) = Listener::bind(address).await.map_err(|e| match e {
            RpcError::Io { message } => RpcError::InvalidAddress(format!(
                "failed to bind {}: {}",
                address, message
            )),
            other => other,
        })?;

        info!("RPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (sessions_tx, sessions) = mpsc::unbounded_channel();

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            handler,
            shutdown_rx,
            sessions_tx,
        ));

        Ok(RpcServerHandle {
            addr,
            sessions,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: Listener,
        handler: Arc<dyn RpcHandler>,
        mut shutdown_rx: oneshot::Receiver<()>,
        sessions: mpsc::UnboundedSender<RpcStream>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((reader, writer, peer)) => {
                            debug!("RPC connection from {}", peer);
                            let stream = RpcStream::with_handler(reader, writer, handler.clone());
                            if sessions.send(stream).is_err() {
                                // Owner dropped the handle between select arms
                                break;
                            }
                        }
                        Err(e) => {
                            error!("RPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handlers;
    use rmpv::Value;

    fn echo_handlers() -> Arc<dyn RpcHandler> {
        Arc::new(
            Handlers::new()
                .on_call("echo", |params| async move { Ok(Value::Array(params)) })
                .on_call("fail", |_| async { Err(Value::from("test failure")) }),
        )
    }

    #[tokio::test]
    async fn test_server_bind_and_shutdown() {
        let mut handle = RpcServer::bind(&Address::tcp("127.0.0.1", 0), echo_handlers())
            .await
            .unwrap();

        match handle.addr() {
            Address::Tcp { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert!(*port > 0);
            }
            other => panic!("Expected TCP address, got: {:?}", other),
        }

        handle.shutdown();
        assert!(handle.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_server_echo_roundtrip() {
        let mut handle = RpcServer::bind(&Address::tcp("127.0.0.1", 0), echo_handlers())
            .await
            .unwrap();

        let client = RpcStream::connect(handle.addr()).await.unwrap();
        let _session = handle.accept().await.unwrap();

        let result = client
            .invoke("echo", vec![Value::from("hello")])
            .await
            .unwrap();
        assert_eq!(result, Value::Array(vec![Value::from("hello")]));

        let err = client.invoke("fail", vec![]).await.unwrap_err();
        assert_eq!(err.remote_payload(), Some(&Value::from("test failure")));

        let err = client.invoke("missing", vec![]).await.unwrap_err();
        assert_eq!(err.remote_payload(), Some(&Value::from("unknown method")));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_bind_in_use_port_fails() {
        let first = RpcServer::bind(&Address::tcp("127.0.0.1", 0), echo_handlers())
            .await
            .unwrap();
        let result = RpcServer::bind(first.addr(), echo_handlers()).await;
        assert!(matches!(result, Err(RpcError::InvalidAddress(_))));
    }
}
