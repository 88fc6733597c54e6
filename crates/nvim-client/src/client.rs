//! Neovim client: connection lifecycle, API bootstrap and global calls.
//!
//! A `Client` is a cheap `Clone` handle. Connecting returns immediately;
//! dialing and API discovery run on a background task while calls queue
//! in the scheduler, which releases them once the API table is known.

use crate::api::ApiTable;
use crate::buffer::Buffer;
use crate::config::ClientConfig;
use crate::convert;
use crate::error::{ClientError, Result};
use crate::handle::Handle;
use crate::scheduler::{CallTarget, QueuedCall, Reply, Scheduler, SchedulerEvent};
use crate::tabpage::Tabpage;
use crate::window::Window;
use nvim_rpc::{Address, Disconnect, Handlers, RpcConfig, RpcError, RpcHandler, RpcStream};
use rmpv::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Lifecycle of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing or waiting for the API table.
    Connecting,
    /// API table resolved; calls are flowing.
    Ready,
    /// Dial, bootstrap or I/O failure.
    ClosedWithError(String),
    /// Closed locally or by the peer.
    ClosedClean,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ConnectionState::ClosedWithError(_) | ConnectionState::ClosedClean
        )
    }
}

/// State published by the scheduler task.
pub(crate) struct Shared {
    pub state: watch::Sender<ConnectionState>,
    /// Written once, at bootstrap.
    pub api: OnceLock<Arc<ApiTable>>,
    /// Written once, when the connection fails or closes.
    pub failure: OnceLock<ClientError>,
}

enum Source {
    Dial(Address),
    Attached(RpcStream),
}

/// Builder for configuring a [`Client`].
///
/// # Example
///
/// ```rust,ignore
/// use nvim_client::Client;
/// use std::time::Duration;
///
/// let client = Client::builder()
///     .timeout(Duration::from_secs(2))
///     .connect("127.0.0.1:6666".parse()?);
/// client.ready().await?;
/// ```
pub struct ClientBuilder {
    timeout: Option<Duration>,
    connect_timeout: Duration,
    handler: Option<Arc<dyn RpcHandler>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: RpcConfig::CONNECT_TIMEOUT,
            handler: None,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-call timeout, also applied to the bootstrap call.
    ///
    /// Default: none (calls wait until answered or the connection closes)
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Upper bound on dialing the address.
    ///
    /// Default: `RpcConfig::CONNECT_TIMEOUT`
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Serve requests and notifications the editor sends to this client.
    pub fn handlers(self, handlers: Handlers) -> Self {
        self.handler(Arc::new(handlers))
    }

    pub fn handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Connect to `address` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(self, address: Address) -> Client {
        Client::spawn(self, Source::Dial(address))
    }

    /// Run the client over an already-connected duplex stream.
    pub fn attach<R, W>(self, reader: R, writer: W) -> Client
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stream = match &self.handler {
            Some(handler) => RpcStream::with_handler(reader, writer, handler.clone()),
            None => RpcStream::new(reader, writer),
        };
        Client::spawn(self, Source::Attached(stream))
    }
}

/// Handle to a neovim connection.
#[derive(Clone)]
pub struct Client {
    events: mpsc::UnboundedSender<SchedulerEvent>,
    shared: Arc<Shared>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect to `address` with default options.
    pub fn connect(address: Address) -> Client {
        ClientBuilder::new().connect(address)
    }

    /// Connect to the address in `NVIM_LISTEN_ADDRESS`.
    pub fn from_env() -> Result<Client> {
        Ok(Self::connect(Address::from_env()?))
    }

    fn spawn(builder: ClientBuilder, source: Source) -> Client {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            state,
            api: OnceLock::new(),
            failure: OnceLock::new(),
        });

        let scheduler = Scheduler::new(shared.clone(), builder.timeout);
        tokio::spawn(scheduler.run(rx));
        tokio::spawn(establish(builder, source, events.downgrade()));

        Client { events, shared }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Wait until the API table is resolved.
    ///
    /// Fails with the connection's terminal error if it closes first.
    pub async fn ready(&self) -> Result<Arc<ApiTable>> {
        let state = self
            .wait_for_state(|state| *state != ConnectionState::Connecting)
            .await;
        match (state, self.shared.api.get()) {
            (ConnectionState::Ready, Some(api)) => Ok(api.clone()),
            _ => Err(self.failure()),
        }
    }

    /// Wait until the connection is closed and return the final state.
    pub async fn closed(&self) -> ConnectionState {
        self.wait_for_state(ConnectionState::is_closed).await
    }

    /// The API table, once resolved.
    pub fn api(&self) -> Option<Arc<ApiTable>> {
        self.shared.api.get().cloned()
    }

    /// Channel id the editor assigned to this connection, once resolved.
    pub fn channel_id(&self) -> Option<u64> {
        self.shared.api.get().map(|api| api.channel_id())
    }

    /// Per-call timeout for calls admitted after this point.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let _ = self.events.send(SchedulerEvent::SetTimeout(timeout));
    }

    /// Half-close the connection. Queued and pending calls fail.
    pub fn close(&self) {
        let _ = self.events.send(SchedulerEvent::Close);
    }

    /// Schedule a call by method name.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.schedule(CallTarget::Name(method.to_string()), args)
            .await
    }

    /// Schedule a call by numeric method id, bypassing the API table.
    pub async fn call_by_id(&self, id: u64, args: Vec<Value>) -> Result<Value> {
        self.schedule(CallTarget::Id(id), args).await
    }

    /// Queue a notification behind every call scheduled before it.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<()> {
        if self.state().is_closed() {
            return Err(self.failure());
        }
        self.send(QueuedCall {
            target: CallTarget::Name(method.to_string()),
            args,
            reply: Reply::Notify,
        })
    }

    async fn schedule(&self, target: CallTarget, args: Vec<Value>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send(QueuedCall {
            target,
            args,
            reply: Reply::Request(tx),
        })?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.failure()),
        }
    }

    fn send(&self, call: QueuedCall) -> Result<()> {
        self.events
            .send(SchedulerEvent::Call(call))
            .map_err(|_| self.failure())
    }

    fn failure(&self) -> ClientError {
        self.shared
            .failure
            .get()
            .cloned()
            .unwrap_or_else(|| ClientError::from(Disconnect::Local.to_error()))
    }

    async fn wait_for_state(&self, done: impl Fn(&ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.shared.state.subscribe();
        let reached = match rx.wait_for(|state| done(state)).await {
            Ok(state) => Some(state.clone()),
            Err(_) => None,
        };
        reached.unwrap_or_else(|| self.state())
    }

    // Global editor calls

    /// Run an Ex command.
    pub async fn command(&self, command: &str) -> Result<()> {
        self.call("vim_command", vec![Value::from(command)]).await?;
        Ok(())
    }

    /// Evaluate a Vimscript expression.
    pub async fn eval(&self, expr: &str) -> Result<Value> {
        self.call("vim_eval", vec![Value::from(expr)]).await
    }

    /// Push keys into the editor's input buffer.
    pub async fn push_keys(&self, keys: &str) -> Result<()> {
        self.call("vim_push_keys", vec![Value::from(keys)]).await?;
        Ok(())
    }

    /// Write to the message area.
    pub async fn out_write(&self, text: &str) -> Result<()> {
        self.call("vim_out_write", vec![Value::from(text)]).await?;
        Ok(())
    }

    /// Write to the error area.
    pub async fn err_write(&self, text: &str) -> Result<()> {
        self.call("vim_err_write", vec![Value::from(text)]).await?;
        Ok(())
    }

    pub async fn get_current_buffer(&self) -> Result<Buffer> {
        let method = "vim_get_current_buffer";
        let handle = convert::as_handle(method, self.call(method, vec![]).await?)?;
        Ok(self.buffer(handle))
    }

    pub async fn get_buffers(&self) -> Result<Vec<Buffer>> {
        let method = "vim_get_buffers";
        let handles = convert::as_handles(method, self.call(method, vec![]).await?)?;
        Ok(handles.into_iter().map(|h| self.buffer(h)).collect())
    }

    pub async fn get_current_window(&self) -> Result<Window> {
        let method = "vim_get_current_window";
        let handle = convert::as_handle(method, self.call(method, vec![]).await?)?;
        Ok(self.window(handle))
    }

    pub async fn get_windows(&self) -> Result<Vec<Window>> {
        let method = "vim_get_windows";
        let handles = convert::as_handles(method, self.call(method, vec![]).await?)?;
        Ok(handles.into_iter().map(|h| self.window(h)).collect())
    }

    pub async fn get_current_tabpage(&self) -> Result<Tabpage> {
        let method = "vim_get_current_tabpage";
        let handle = convert::as_handle(method, self.call(method, vec![]).await?)?;
        Ok(self.tabpage(handle))
    }

    pub async fn get_tabpages(&self) -> Result<Vec<Tabpage>> {
        let method = "vim_get_tabpages";
        let handles = convert::as_handles(method, self.call(method, vec![]).await?)?;
        Ok(handles.into_iter().map(|h| self.tabpage(h)).collect())
    }

    /// Proxy for a buffer handle obtained elsewhere.
    pub fn buffer(&self, handle: Handle) -> Buffer {
        Buffer::new(handle, self.clone())
    }

    pub fn window(&self, handle: Handle) -> Window {
        Window::new(handle, self.clone())
    }

    pub fn tabpage(&self, handle: Handle) -> Tabpage {
        Tabpage::new(handle, self.clone())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("channel_id", &self.channel_id())
            .finish()
    }
}

/// Dial (if needed), hand the stream to the scheduler, run the bootstrap
/// call and report the outcome.
///
/// Holds only a weak sender: once every `Client` is gone the outcome has
/// nowhere to go and the stream is dropped with this task.
async fn establish(
    builder: ClientBuilder,
    source: Source,
    events: mpsc::WeakUnboundedSender<SchedulerEvent>,
) {
    let stream = match source {
        Source::Attached(stream) => stream,
        Source::Dial(address) => match dial(&builder, &address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                report(&events, SchedulerEvent::Failed(e));
                return;
            }
        },
    };

    stream.set_timeout(builder.timeout);
    // The scheduler owns the stream from here, so close() reaches it
    // while bootstrap is in flight
    if !report(&events, SchedulerEvent::Connected(stream.clone())) {
        return;
    }

    let outcome = match bootstrap(&stream).await {
        Ok(api) => SchedulerEvent::Ready(Arc::new(api)),
        Err(e) => {
            stream.close();
            SchedulerEvent::Failed(e)
        }
    };
    report(&events, outcome);
}

fn report(events: &mpsc::WeakUnboundedSender<SchedulerEvent>, event: SchedulerEvent) -> bool {
    match events.upgrade() {
        Some(events) => events.send(event).is_ok(),
        None => false,
    }
}

async fn dial(builder: &ClientBuilder, address: &Address) -> Result<RpcStream> {
    let connect = async {
        match &builder.handler {
            Some(handler) => RpcStream::connect_with_handler(address, handler.clone()).await,
            None => RpcStream::connect(address).await,
        }
    };
    let stream = tokio::time::timeout(builder.connect_timeout, connect)
        .await
        .map_err(|_| RpcError::ConnectionClosed {
            reason: format!(
                "timed out connecting to {} after {:?}",
                address, builder.connect_timeout
            ),
        })??;
    Ok(stream)
}

/// Issue the reserved discovery call and parse the API table.
pub(crate) async fn bootstrap(stream: &RpcStream) -> Result<ApiTable> {
    debug!("Requesting API table");
    let response = stream
        .invoke(ClientConfig::BOOTSTRAP_METHOD_ID, vec![])
        .await
        .map_err(|e| ClientError::bootstrap(e.to_string()))?;
    ApiTable::from_bootstrap(response)
}
