//! One cached `RpcStream` per address.

use crate::handler::RpcHandler;
use crate::stream::RpcStream;
use crate::transport::Address;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Pool of open streams keyed by address.
///
/// `get` reuses a live stream for the address or dials a new one. The
/// lock is held across the dial so concurrent callers for the same
/// address share one connection.
#[derive(Clone, Default)]
pub struct SessionPool {
    sessions: Arc<Mutex<HashMap<Address, RpcStream>>>,
    handler: Option<Arc<dyn RpcHandler>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve inbound calls on every pooled stream with `handler`.
    pub fn with_handler(handler: Arc<dyn RpcHandler>) -> Self {
        Self {
            sessions: Arc::default(),
            handler: Some(handler),
        }
    }

    /// The open stream for `address`, connecting if needed.
    ///
    /// A cached stream that has since closed is replaced.
    pub async fn get(&self, address: &Address) -> Result<RpcStream> {
        let mut sessions = self.sessions.lock().await;

        if let Some(stream) = sessions.get(address) {
            if !stream.is_closed() {
                return Ok(stream.clone());
            }
            debug!("Replacing closed session for {}", address);
        }

        let stream = match &self.handler {
            Some(handler) => RpcStream::connect_with_handler(address, handler.clone()).await?,
            None => RpcStream::connect(address).await?,
        };
        sessions.insert(address.clone(), stream.clone());
        Ok(stream)
    }

    /// Close and forget every cached stream.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (address, stream) in sessions.drain() {
            debug!("Closing session for {}", address);
            stream.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("has_handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}
