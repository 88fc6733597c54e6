//! Single-flight scheduler.
//!
//! The editor serves one call at a time, so at most one request may be on
//! the wire. Calls queue in FIFO order; the head is admitted only while
//! the scheduler is idle, and the next one only after the previous call's
//! caller has been settled.
//!
//! ```text
//!              api resolved          admit request
//! AwaitingApi ─────────────▶ Idle ──────────────────▶ Sending
//!      │                      ▲                          │
//!      │                      └──────── settled ─────────┘
//!      └──────────── stream closed / bootstrap failed ──────▶ Failed
//! ```
//!
//! `SchedulerState` holds the transitions and does no I/O. `Scheduler` is
//! the task that owns it and performs what it admits.

use crate::api::ApiTable;
use crate::client::{ConnectionState, Shared};
use crate::error::{ClientError, Result};
use futures::future::{BoxFuture, OptionFuture};
use futures::FutureExt;
use nvim_rpc::{Disconnect, Method, RpcError, RpcStream};
use rmpv::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How a queued call names its remote method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallTarget {
    /// Translated through the API table at admission.
    Name(String),
    /// Sent as is.
    Id(u64),
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Name(name) => write!(f, "{}", name),
            CallTarget::Id(id) => write!(f, "#{}", id),
        }
    }
}

/// Completion path of a queued call.
#[derive(Debug)]
pub(crate) enum Reply {
    Request(oneshot::Sender<Result<Value>>),
    /// Notifications have no caller waiting.
    Notify,
}

#[derive(Debug)]
pub(crate) struct QueuedCall {
    pub target: CallTarget,
    pub args: Vec<Value>,
    pub reply: Reply,
}

#[derive(Debug, Clone)]
pub(crate) enum Phase {
    AwaitingApi,
    Idle,
    Sending,
    Failed(ClientError),
}

/// What the driver must do with the call at the head of the queue.
#[derive(Debug)]
pub(crate) enum Admission {
    Request {
        method: Method,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Notify {
        method: Method,
        args: Vec<Value>,
    },
    /// Fails before reaching the wire.
    Rejected { reply: Reply, error: ClientError },
}

#[derive(Debug)]
pub(crate) struct SchedulerState {
    phase: Phase,
    queue: VecDeque<QueuedCall>,
    api: Option<Arc<ApiTable>>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingApi,
            queue: VecDeque::new(),
            api: None,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Append a call. On a failed connection the call is handed back
    /// with the failure instead.
    pub fn enqueue(&mut self, call: QueuedCall) -> Option<(Reply, ClientError)> {
        if let Phase::Failed(error) = &self.phase {
            return Some((call.reply, error.clone()));
        }
        self.queue.push_back(call);
        None
    }

    pub fn api_resolved(&mut self, api: Arc<ApiTable>) {
        if matches!(self.phase, Phase::AwaitingApi) {
            self.api = Some(api);
            self.phase = Phase::Idle;
        }
    }

    /// Pop the head of the queue if a call may be admitted now.
    ///
    /// Admitting a request moves to `Sending`; notifications and rejected
    /// calls leave the scheduler idle so the caller keeps admitting.
    pub fn admit(&mut self) -> Option<Admission> {
        if !matches!(self.phase, Phase::Idle) {
            return None;
        }
        let call = self.queue.pop_front()?;

        let method = match self.translate(&call.target, call.args.len()) {
            Ok(method) => method,
            Err(error) => {
                return Some(Admission::Rejected {
                    reply: call.reply,
                    error,
                })
            }
        };

        match call.reply {
            Reply::Request(reply) => {
                self.phase = Phase::Sending;
                Some(Admission::Request {
                    method,
                    args: call.args,
                    reply,
                })
            }
            Reply::Notify => Some(Admission::Notify {
                method,
                args: call.args,
            }),
        }
    }

    /// The in-flight request's caller has been settled.
    pub fn settled(&mut self) {
        if matches!(self.phase, Phase::Sending) {
            self.phase = Phase::Idle;
        }
    }

    /// Enter the terminal state and hand back every queued call.
    ///
    /// Returns `None` if already failed; the first failure is kept.
    pub fn fail(&mut self, error: ClientError) -> Option<Vec<QueuedCall>> {
        if matches!(self.phase, Phase::Failed(_)) {
            return None;
        }
        self.phase = Phase::Failed(error);
        Some(self.queue.drain(..).collect())
    }

    fn translate(&self, target: &CallTarget, arg_count: usize) -> Result<Method> {
        match target {
            CallTarget::Id(id) => Ok(Method::Id(*id)),
            CallTarget::Name(name) => {
                let api = self.api.as_ref().ok_or_else(|| ClientError::MethodNotFound {
                    name: name.clone(),
                })?;
                let descriptor = api.resolve(name)?;
                descriptor.check_arity(arg_count)?;
                Ok(Method::Id(descriptor.id))
            }
        }
    }
}

/// Inputs to the scheduler task.
#[derive(Debug)]
pub(crate) enum SchedulerEvent {
    Call(QueuedCall),
    /// Dialed or attached; the bootstrap call is about to go out.
    Connected(RpcStream),
    Ready(Arc<ApiTable>),
    Failed(ClientError),
    SetTimeout(Option<Duration>),
    Close,
}

type Settlement = (
    oneshot::Sender<Result<Value>>,
    std::result::Result<Value, RpcError>,
);

/// Task that owns the scheduler state and the connection's stream.
pub(crate) struct Scheduler {
    state: SchedulerState,
    stream: Option<RpcStream>,
    timeout: Option<Duration>,
    closing: bool,
    in_flight: Option<BoxFuture<'static, Settlement>>,
    closed: Option<BoxFuture<'static, Disconnect>>,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(shared: Arc<Shared>, timeout: Option<Duration>) -> Self {
        Self {
            state: SchedulerState::new(),
            stream: None,
            timeout,
            closing: false,
            in_flight: None,
            closed: None,
            shared,
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SchedulerEvent>) {
        loop {
            self.admit_ready_calls();

            tokio::select! {
                Some((reply, outcome)) = OptionFuture::from(self.in_flight.as_mut()), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    // Settle the caller before admitting the next call
                    let _ = reply.send(outcome.map_err(ClientError::from));
                    self.state.settled();
                }
                Some(reason) = OptionFuture::from(self.closed.as_mut()), if self.closed.is_some() => {
                    self.closed = None;
                    self.stream_closed(reason);
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                }
            }
        }

        // Every client handle is gone
        if let Some(stream) = &self.stream {
            stream.close();
        }
    }

    fn handle(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Call(call) => {
                let target = call.target.to_string();
                match self.state.enqueue(call) {
                    Some((reply, error)) => reject(reply, error),
                    None => debug!("Queued {} ({} waiting)", target, self.state.queued()),
                }
            }
            SchedulerEvent::Connected(stream) => self.connected(stream),
            SchedulerEvent::Ready(api) => self.ready(api),
            SchedulerEvent::Failed(error) => {
                let state = ConnectionState::ClosedWithError(error.to_string());
                self.fail(error, state);
            }
            SchedulerEvent::SetTimeout(timeout) => {
                self.timeout = timeout;
                if let Some(stream) = &self.stream {
                    stream.set_timeout(timeout);
                }
            }
            SchedulerEvent::Close => {
                self.closing = true;
                if let Some(stream) = &self.stream {
                    stream.close();
                }
                // Once ready, settles through the closed branch
                if self.closed.is_none() {
                    let error = ClientError::from(Disconnect::Local.to_error());
                    self.fail(error, ConnectionState::ClosedClean);
                }
            }
        }
    }

    fn connected(&mut self, stream: RpcStream) {
        if self.closing || matches!(self.state.phase(), Phase::Failed(_)) {
            debug!("Connected after close; closing the stream");
            stream.close();
            return;
        }
        stream.set_timeout(self.timeout);
        self.stream = Some(stream);
    }

    fn ready(&mut self, api: Arc<ApiTable>) {
        if self.closing || matches!(self.state.phase(), Phase::Failed(_)) {
            debug!("API table arrived after close; ignoring it");
            return;
        }
        let Some(stream) = &self.stream else {
            warn!("API table arrived without a connected stream");
            return;
        };

        info!(
            "Connected to editor: channel {}, {} methods",
            api.channel_id(),
            api.len()
        );

        let watched = stream.clone();
        self.closed = Some(async move { watched.closed().await }.boxed());

        let _ = self.shared.api.set(api.clone());
        self.state.api_resolved(api);
        self.shared.state.send_replace(ConnectionState::Ready);
    }

    fn stream_closed(&mut self, reason: Disconnect) {
        let state = match &reason {
            Disconnect::Failed(message) => ConnectionState::ClosedWithError(message.clone()),
            Disconnect::Local | Disconnect::Peer => ConnectionState::ClosedClean,
        };
        self.fail(ClientError::from(reason.to_error()), state);
    }

    fn fail(&mut self, error: ClientError, state: ConnectionState) {
        let Some(drained) = self.state.fail(error.clone()) else {
            return;
        };

        if matches!(state, ConnectionState::ClosedWithError(_)) {
            warn!("Connection failed: {}", error);
        } else {
            info!("Connection closed: {}", error);
        }
        if !drained.is_empty() {
            debug!("Failing {} queued calls", drained.len());
        }
        for call in drained {
            reject(call.reply, error.clone());
        }

        let _ = self.shared.failure.set(error);
        self.shared.state.send_replace(state);
    }

    fn admit_ready_calls(&mut self) {
        while let Some(admission) = self.state.admit() {
            match admission {
                Admission::Request {
                    method,
                    args,
                    reply,
                } => match self.stream.clone() {
                    Some(stream) => {
                        debug!("Admitting {}", method);
                        self.in_flight = Some(
                            async move {
                                let outcome = stream.invoke(method, args).await;
                                (reply, outcome)
                            }
                            .boxed(),
                        );
                    }
                    None => {
                        let _ = reply.send(Err(ClientError::from(Disconnect::Local.to_error())));
                        self.state.settled();
                    }
                },
                Admission::Notify { method, args } => {
                    if let Some(stream) = &self.stream {
                        debug!("Admitting notification {}", method);
                        if let Err(e) = stream.notify(method, args) {
                            debug!("Notification dropped: {}", e);
                        }
                    }
                }
                Admission::Rejected { reply, error } => reject(reply, error),
            }
        }
    }
}

fn reject(reply: Reply, error: ClientError) {
    match reply {
        Reply::Request(tx) => {
            let _ = tx.send(Err(error));
        }
        Reply::Notify => debug!("Dropping notification: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MethodDescriptor, Param};

    fn api() -> Arc<ApiTable> {
        let expr = Param {
            name: "expr".into(),
            type_name: None,
        };
        Arc::new(
            ApiTable::new(
                1,
                vec![
                    MethodDescriptor::new("vim_eval", 5, Some(vec![expr])),
                    MethodDescriptor::new("vim_command", 3, None),
                ],
            )
            .unwrap(),
        )
    }

    fn request(name: &str, args: Vec<Value>) -> (QueuedCall, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        let call = QueuedCall {
            target: CallTarget::Name(name.to_string()),
            args,
            reply: Reply::Request(tx),
        };
        (call, rx)
    }

    fn notification(name: &str) -> QueuedCall {
        QueuedCall {
            target: CallTarget::Name(name.to_string()),
            args: vec![],
            reply: Reply::Notify,
        }
    }

    fn admitted_method(admission: Option<Admission>) -> Method {
        match admission {
            Some(Admission::Request { method, .. }) => method,
            other => panic!("Expected request admission, got: {:?}", other),
        }
    }

    #[test]
    fn test_calls_wait_for_api() {
        let mut state = SchedulerState::new();
        let (a, _a) = request("vim_eval", vec![Value::from("1+1")]);
        let (b, _b) = request("vim_eval", vec![Value::from("2+2")]);
        assert!(state.enqueue(a).is_none());
        assert!(state.enqueue(b).is_none());

        assert!(state.admit().is_none());
        assert_eq!(state.queued(), 2);

        state.api_resolved(api());
        assert_eq!(admitted_method(state.admit()), Method::Id(5));
        assert!(matches!(state.phase(), Phase::Sending));
    }

    #[test]
    fn test_single_flight_until_settled() {
        let mut state = SchedulerState::new();
        state.api_resolved(api());

        let (a, _a) = request("vim_eval", vec![Value::from("1+1")]);
        let (b, _b) = request("vim_command", vec![Value::from("echo")]);
        state.enqueue(a);
        state.enqueue(b);

        assert_eq!(admitted_method(state.admit()), Method::Id(5));
        // B stays queued while A is in flight
        assert!(state.admit().is_none());

        state.settled();
        assert_eq!(admitted_method(state.admit()), Method::Id(3));
        assert_eq!(state.queued(), 0);
    }

    #[test]
    fn test_notification_does_not_occupy_slot() {
        let mut state = SchedulerState::new();
        state.api_resolved(api());

        state.enqueue(notification("vim_command"));
        let (a, _a) = request("vim_eval", vec![Value::from("1")]);
        state.enqueue(a);

        assert!(matches!(
            state.admit(),
            Some(Admission::Notify {
                method: Method::Id(3),
                ..
            })
        ));
        assert!(matches!(state.phase(), Phase::Idle));
        assert_eq!(admitted_method(state.admit()), Method::Id(5));
    }

    #[test]
    fn test_unknown_name_and_arity_are_rejected_without_sending() {
        let mut state = SchedulerState::new();
        state.api_resolved(api());

        let (missing, _m) = request("vim_nope", vec![]);
        let (wrong, _w) = request("vim_eval", vec![]);
        state.enqueue(missing);
        state.enqueue(wrong);

        assert!(matches!(
            state.admit(),
            Some(Admission::Rejected {
                error: ClientError::MethodNotFound { .. },
                ..
            })
        ));
        assert!(matches!(
            state.admit(),
            Some(Admission::Rejected {
                error: ClientError::ArityMismatch { .. },
                ..
            })
        ));
        assert!(matches!(state.phase(), Phase::Idle));
    }

    #[test]
    fn test_numeric_target_bypasses_table() {
        let mut state = SchedulerState::new();
        state.api_resolved(api());

        let (tx, _rx) = oneshot::channel();
        state.enqueue(QueuedCall {
            target: CallTarget::Id(42),
            args: vec![],
            reply: Reply::Request(tx),
        });
        assert_eq!(admitted_method(state.admit()), Method::Id(42));
    }

    #[test]
    fn test_fail_drains_queue_and_rejects_later_calls() {
        let mut state = SchedulerState::new();
        let (a, _a) = request("vim_eval", vec![]);
        state.enqueue(a);

        let drained = state.fail(ClientError::bootstrap("bad table")).unwrap();
        assert_eq!(drained.len(), 1);
        assert!(state.fail(ClientError::bootstrap("again")).is_none());

        let (b, _b) = request("vim_eval", vec![]);
        match state.enqueue(b) {
            Some((_, ClientError::BootstrapFailure { message })) => assert_eq!(message, "bad table"),
            other => panic!("Expected immediate rejection, got: {:?}", other.map(|(_, e)| e)),
        }

        // A late api never revives a failed scheduler
        state.api_resolved(api());
        assert!(matches!(state.phase(), Phase::Failed(_)));
    }
}
