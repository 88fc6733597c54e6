//! Correlation stream: a request/response/notify message bus over one
//! duplex byte stream.
//!
//! # Architecture
//!
//! ```text
//!   RpcStream (Clone)  ──commands──┐
//!   Responder          ──commands──┤
//!   timeout timers     ──commands──┼──▶ connection task ──frames──▶ writer task
//!   reader task        ──frames────┤    (pending map, seq ids,        │
//!   writer task        ──failure───┘     timeout)                     ▼
//!                                                                   socket
//! ```
//!
//! All connection state is owned by one task and mutated only while it
//! handles the next command, so the pending map needs no lock. The reader
//! task decodes inbound frames and feeds them into the same ordered
//! channel as caller commands. The connection task never awaits socket
//! I/O: a peer that stops reading stalls only the writer task, while
//! timeouts and `close()` keep settling calls.
//!
//! Every pending call settles exactly once: by its response, by its
//! timeout, or by the disconnect that fans out to all pending calls.
//! Settling removes the entry from the map, so a second settlement has
//! nothing to act on.

use crate::config::RpcConfig;
use crate::handler::{Responder, RpcHandler};
use crate::protocol::{read_value, write_message, Message, MessageDecoder, Method};
use crate::transport::{Address, BoxedReader, BoxedWriter};
use crate::{Result, RpcError};
use rmpv::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Why a stream stopped carrying calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// `close()` was called on this side.
    Local,
    /// The peer ended the stream.
    Peer,
    /// A read or write failed.
    Failed(String),
}

impl Disconnect {
    pub fn is_error(&self) -> bool {
        matches!(self, Disconnect::Failed(_))
    }

    /// The error delivered to calls that were pending or issued afterwards.
    pub fn to_error(&self) -> RpcError {
        RpcError::ConnectionClosed {
            reason: self.to_string(),
        }
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Local => write!(f, "connection closed locally"),
            Disconnect::Peer => write!(f, "connection closed by peer"),
            Disconnect::Failed(message) => write!(f, "{}", message),
        }
    }
}

/// Something observed on the stream, broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Request {
        seq: u32,
        method: Method,
        params: Vec<Value>,
    },
    Notification {
        method: Method,
        params: Vec<Value>,
    },
    /// A non-fatal anomaly: unmatched response or malformed frame.
    ProtocolError(RpcError),
    Closed(Disconnect),
}

/// Allocator for outgoing request ids.
///
/// Starts at 0 and wraps to 0 after [`RpcConfig::MAX_SEQID`].
#[derive(Debug, Default)]
pub struct SequenceIds {
    last: Option<u32>,
}

impl SequenceIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after `last`, so the next id is `last + 1` (or 0 on wrap).
    #[cfg(test)]
    pub(crate) fn starting_after(last: u32) -> Self {
        Self { last: Some(last) }
    }

    pub fn next(&mut self) -> u32 {
        let next = match self.last {
            None => 0,
            Some(last) if last >= RpcConfig::MAX_SEQID => 0,
            Some(last) => last + 1,
        };
        self.last = Some(next);
        next
    }

    /// Next id for which `in_use` is false.
    ///
    /// After a wrap, ids still held by pending calls are skipped.
    pub fn next_free(&mut self, in_use: impl Fn(u32) -> bool) -> u32 {
        loop {
            let seq = self.next();
            if !in_use(seq) {
                return seq;
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Invoke {
        method: Method,
        params: Vec<Value>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Notify {
        method: Method,
        params: Vec<Value>,
    },
    Respond {
        seq: u32,
        outcome: std::result::Result<Value, Value>,
    },
    SetTimeout(Option<Duration>),
    Expire {
        seq: u32,
        token: u64,
        after: Duration,
    },
    Inbound(Message),
    Malformed(RpcError),
    ReadEnded(Disconnect),
    WriteFailed(String),
    Close,
}

/// Work for the writer task.
enum Outbound {
    Frame(Message),
    /// Flush what is queued, then half-close.
    Shutdown,
}

/// Handle to one msgpack-rpc connection.
///
/// Cloning is cheap; all clones drive the same connection. When every
/// handle is dropped the connection is closed.
#[derive(Clone)]
pub struct RpcStream {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<Option<Disconnect>>,
    events: broadcast::Sender<StreamEvent>,
}

impl RpcStream {
    /// Wrap an already-connected duplex stream.
    ///
    /// Spawns the connection tasks, so this must be called from within a
    /// tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(Box::new(reader), Box::new(writer), None, SequenceIds::new())
    }

    #[cfg(test)]
    pub(crate) fn with_sequence_ids<R, W>(reader: R, writer: W, seq_ids: SequenceIds) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(Box::new(reader), Box::new(writer), None, seq_ids)
    }

    /// Wrap a connected stream and serve the peer's calls with `handler`.
    pub fn with_handler<R, W>(reader: R, writer: W, handler: Arc<dyn RpcHandler>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(
            Box::new(reader),
            Box::new(writer),
            Some(handler),
            SequenceIds::new(),
        )
    }

    /// Dial `address` and wrap the resulting connection.
    pub async fn connect(address: &Address) -> Result<Self> {
        let (reader, writer) = address.connect().await?;
        info!("RPC stream connected to {}", address);
        Ok(Self::spawn(reader, writer, None, SequenceIds::new()))
    }

    /// Dial `address` and serve the peer's calls with `handler`.
    pub async fn connect_with_handler(
        address: &Address,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<Self> {
        let (reader, writer) = address.connect().await?;
        info!("RPC stream connected to {}", address);
        Ok(Self::spawn(reader, writer, Some(handler), SequenceIds::new()))
    }

    fn spawn(
        reader: BoxedReader,
        writer: BoxedWriter,
        handler: Option<Arc<dyn RpcHandler>>,
        seq_ids: SequenceIds,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(None);
        let (events, _) = broadcast::channel(RpcConfig::EVENT_CHANNEL_CAPACITY);

        let notifications = handler.clone().map(spawn_notification_dispatcher);
        let read_task = tokio::spawn(read_loop(reader, commands.downgrade()));
        let write_task = tokio::spawn(write_loop(writer, outbound_rx, commands.downgrade()));

        let connection = Connection {
            outbound,
            pending: HashMap::new(),
            seq_ids,
            timeout: None,
            next_token: 0,
            handler,
            notifications,
            commands: commands.downgrade(),
            events: events.clone(),
            state: state_tx,
            read_task,
            write_task,
        };
        tokio::spawn(connection.run(rx));

        Self {
            commands,
            state,
            events,
        }
    }

    /// Send a request and wait for its settlement.
    pub async fn invoke(&self, method: impl Into<Method>, params: Vec<Value>) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Invoke {
            method: method.into(),
            params,
            reply,
        })?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Send a notification. Fails only if the stream is already closed.
    pub fn notify(&self, method: impl Into<Method>, params: Vec<Value>) -> Result<()> {
        if let Some(reason) = self.disconnect() {
            return Err(reason.to_error());
        }
        self.send(Command::Notify {
            method: method.into(),
            params,
        })
    }

    /// Answer an inbound request by its sequence id.
    ///
    /// Handlers normally answer through their [`Responder`]; this is the
    /// same path for callers that track inbound ids themselves.
    pub fn respond(&self, seq: u32, outcome: std::result::Result<Value, Value>) -> Result<()> {
        self.send(Command::Respond { seq, outcome })
    }

    /// Per-call timeout for requests issued after this call.
    ///
    /// `None` disables the timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let _ = self.commands.send(Command::SetTimeout(timeout));
    }

    /// Half-close the stream and fail every pending call.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Why the stream closed, if it has.
    pub fn disconnect(&self) -> Option<Disconnect> {
        self.state.borrow().clone()
    }

    /// Wait until the stream closes.
    pub async fn closed(&self) -> Disconnect {
        let mut state = self.state.clone();
        let reason = match state.wait_for(|s| s.is_some()).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| Disconnect::Failed("connection task stopped".to_string()))
    }

    /// Subscribe to inbound traffic and protocol anomalies.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> RpcError {
        match self.disconnect() {
            Some(reason) => reason.to_error(),
            None => RpcError::ConnectionClosed {
                reason: "connection task stopped".to_string(),
            },
        }
    }
}

impl fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("closed", &self.disconnect())
            .finish()
    }
}

struct PendingCall {
    reply: oneshot::Sender<Result<Value>>,
    token: u64,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn settle(self, outcome: Result<Value>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.reply.send(outcome);
    }
}

/// State owned by the connection task.
struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: HashMap<u32, PendingCall>,
    seq_ids: SequenceIds,
    timeout: Option<Duration>,
    next_token: u64,
    handler: Option<Arc<dyn RpcHandler>>,
    notifications: Option<mpsc::UnboundedSender<(String, Vec<Value>)>>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<StreamEvent>,
    state: watch::Sender<Option<Disconnect>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Connection {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }

        // Every handle is gone
        self.shutdown(Disconnect::Local);
        self.read_task.abort();

        // Give queued frames a chance to reach a peer that is still reading
        let drained = tokio::time::timeout(RpcConfig::WRITE_DRAIN_TIMEOUT, &mut self.write_task);
        if drained.await.is_err() {
            debug!("Peer stopped reading; dropping unsent frames");
            self.write_task.abort();
        }
    }

    fn disconnect(&self) -> Option<Disconnect> {
        self.state.borrow().clone()
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Invoke {
                method,
                params,
                reply,
            } => self.invoke(method, params, reply),
            Command::Notify { method, params } => {
                if self.disconnect().is_some() {
                    debug!("Dropping notification {} on closed stream", method);
                    return;
                }
                debug!("-> notify {}", method);
                self.write(Message::Notification { method, params });
            }
            Command::Respond { seq, outcome } => {
                if self.disconnect().is_some() {
                    debug!("Dropping response for seq {} on closed stream", seq);
                    return;
                }
                let (error, result) = match outcome {
                    Ok(result) => (None, result),
                    Err(error) => (Some(error), Value::Nil),
                };
                debug!("-> response seq={}", seq);
                self.write(Message::Response { seq, error, result });
            }
            Command::SetTimeout(timeout) => {
                debug!("Per-call timeout set to {:?}", timeout);
                self.timeout = timeout;
            }
            Command::Expire { seq, token, after } => {
                let current = self.pending.get(&seq).map(|call| call.token);
                if current == Some(token) {
                    if let Some(call) = self.pending.remove(&seq) {
                        warn!("Request seq={} timed out after {:?}", seq, after);
                        call.settle(Err(RpcError::Timeout(after)));
                    }
                }
            }
            Command::Inbound(message) => self.dispatch(message),
            Command::Malformed(err) => {
                warn!("Ignoring malformed frame: {}", err);
                self.emit(StreamEvent::ProtocolError(err));
            }
            Command::ReadEnded(reason) => self.shutdown(reason),
            Command::WriteFailed(message) => self.shutdown(Disconnect::Failed(message)),
            Command::Close => self.shutdown(Disconnect::Local),
        }
    }

    fn invoke(
        &mut self,
        method: Method,
        params: Vec<Value>,
        reply: oneshot::Sender<Result<Value>>,
    ) {
        if let Some(reason) = self.disconnect() {
            let _ = reply.send(Err(reason.to_error()));
            return;
        }

        let pending = &self.pending;
        let seq = self.seq_ids.next_free(|seq| pending.contains_key(&seq));
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);

        let timer = self.timeout.map(|after| {
            let commands = self.commands.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::Expire { seq, token, after });
                }
            })
            .abort_handle()
        });
        self.pending.insert(seq, PendingCall { reply, token, timer });

        debug!("-> request seq={} method={}", seq, method);
        self.write(Message::Request {
            seq,
            method,
            params,
        });
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::Response { seq, error, result } => match self.pending.remove(&seq) {
                Some(call) => {
                    debug!("<- response seq={}", seq);
                    let outcome = match error {
                        Some(error) => Err(RpcError::Remote(error)),
                        None => Ok(result),
                    };
                    call.settle(outcome);
                }
                None => {
                    warn!("Unexpected response with unrecognized seqid ({})", seq);
                    self.emit(StreamEvent::ProtocolError(RpcError::UnmatchedResponse {
                        seq,
                    }));
                }
            },
            Message::Request {
                seq,
                method,
                params,
            } => {
                debug!("<- request seq={} method={}", seq, method);
                if self.events.receiver_count() > 0 {
                    self.emit(StreamEvent::Request {
                        seq,
                        method: method.clone(),
                        params: params.clone(),
                    });
                }

                let key = method.key();
                let handler = self
                    .handler
                    .as_ref()
                    .filter(|handler| handler.handles_request(&key))
                    .cloned();
                match (handler, self.commands.upgrade()) {
                    (Some(handler), Some(commands)) => {
                        let responder = Responder::new(seq, commands);
                        tokio::spawn(async move {
                            handler.request(&key, params, responder).await;
                        });
                    }
                    _ => {
                        warn!("No handler for inbound request {}", method);
                        self.emit(StreamEvent::ProtocolError(RpcError::UnknownMethod {
                            method: key,
                        }));
                        self.write(Message::Response {
                            seq,
                            error: Some(Value::from(RpcConfig::UNKNOWN_METHOD_ERROR)),
                            result: Value::Nil,
                        });
                    }
                }
            }
            Message::Notification { method, params } => {
                debug!("<- notify {}", method);
                if self.events.receiver_count() > 0 {
                    self.emit(StreamEvent::Notification {
                        method: method.clone(),
                        params: params.clone(),
                    });
                }
                if let Some(notifications) = &self.notifications {
                    let _ = notifications.send((method.key(), params));
                }
            }
        }
    }

    fn write(&mut self, message: Message) {
        // A failed writer reports back through `Command::WriteFailed`
        if self.outbound.send(Outbound::Frame(message)).is_err() {
            debug!("Writer stopped; frame dropped");
        }
    }

    /// Close the stream once and fan the reason out to every pending call.
    fn shutdown(&mut self, reason: Disconnect) {
        if self.disconnect().is_some() {
            return;
        }

        if reason.is_error() {
            warn!("RPC stream failed: {}", reason);
        } else {
            info!("RPC stream closed: {}", reason);
        }

        // Half-close after queued frames; the peer may still send until it
        // closes its side
        let _ = self.outbound.send(Outbound::Shutdown);

        self.state.send_replace(Some(reason.clone()));
        self.fail_all(&reason);
        self.emit(StreamEvent::Closed(reason));
    }

    fn fail_all(&mut self, reason: &Disconnect) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            debug!("Failing {} pending calls: {}", pending.len(), reason);
        }
        for (_, call) in pending {
            call.settle(Err(reason.to_error()));
        }
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }
}

fn spawn_notification_dispatcher(
    handler: Arc<dyn RpcHandler>,
) -> mpsc::UnboundedSender<(String, Vec<Value>)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Vec<Value>)>();
    tokio::spawn(async move {
        // One at a time, in arrival order
        while let Some((method, params)) = rx.recv().await {
            handler.notify(&method, params).await;
        }
    });
    tx
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut frames: mpsc::UnboundedReceiver<Outbound>,
    commands: mpsc::WeakUnboundedSender<Command>,
) {
    while let Some(outbound) = frames.recv().await {
        match outbound {
            Outbound::Frame(message) => {
                if let Err(e) = write_message(&mut writer, &message).await {
                    warn!("Write failed: {}", e);
                    if let Some(commands) = commands.upgrade() {
                        let _ = commands.send(Command::WriteFailed(format!("write failed: {}", e)));
                    }
                    return;
                }
            }
            Outbound::Shutdown => {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

async fn read_loop(mut reader: BoxedReader, commands: mpsc::WeakUnboundedSender<Command>) {
    let mut decoder = MessageDecoder::new();
    loop {
        let command = match read_value(&mut reader, &mut decoder).await {
            Ok(Some(value)) => match Message::from_value(value) {
                Ok(message) => Command::Inbound(message),
                Err(e) => Command::Malformed(e),
            },
            Ok(None) => Command::ReadEnded(Disconnect::Peer),
            Err(e) => Command::ReadEnded(Disconnect::Failed(format!("read failed: {}", e))),
        };

        let ended = matches!(command, Command::ReadEnded(_));
        let Some(commands) = commands.upgrade() else {
            break;
        };
        if commands.send(command).is_err() || ended {
            break;
        }
    }
}
