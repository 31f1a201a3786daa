//! Remote call brokering.
//!
//! A caller's CALC is resolved to the session that registered the function,
//! queued on that session's single-slot call channel, and answered by the
//! handler's ready-worker once the handler connection sends DONE.
//!
//! ```text
//!  caller conn          Broker::call            handler ReadyWorker        handler conn
//!  ───────────          ────────────            ───────────────────        ────────────
//!  C{func,data} ──────▶ resolve func
//!                       dispatch(PendingCall) ─▶ calls.recv()
//!                                                C<data> ─────────────────▶ compute
//!                                                replies.recv() ◀───────── D<answer>
//!  D<answer>    ◀────── reply.await ◀─────────── reply.send(answer)
//! ```
//!
//! Each call carries its own one-shot reply channel, so calls to different
//! handlers never contend. A handler serves one call at a time; the DONE
//! frame has no call id and always answers the call in flight.
//!
//! Nothing in the round trip waits forever: the caller gives up after the
//! configured timeout, and a handler that disconnects drops its ready-worker,
//! which drops every call it holds or has queued.

use crate::credentials::CredentialStore;
use crate::protocol::Response;
use crate::registry::{FunctionRegistry, SessionRegistry};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Capacity of a session's inbound call channel
pub const CALL_SLOTS: usize = 1;

/// Sent to a handler that replies while no call is in flight
pub const NO_PENDING_CALL: &str = "no call is awaiting a reply";

/// A call travelling from a caller to a handler's ready-worker.
#[derive(Debug)]
pub struct PendingCall {
    pub id: u64,
    pub caller: String,
    pub function: String,
    pub data: Bytes,
    reply: oneshot::Sender<Bytes>,
}

/// Reasons a CALC fails
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CallError {
    #[error("function '{0}' wasn't registered on server")]
    NotRegistered(String),
    #[error("function '{0}' is served by this connection")]
    OwnFunction(String),
    #[error("handler disconnected")]
    HandlerGone,
    #[error("call timed out")]
    TimedOut,
}

/// Reasons a POST fails
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PostError {
    #[error("function name must not be empty")]
    EmptyName,
    #[error("function with this name already exists")]
    AlreadyBound,
}

/// Shared server state handed to every connection
pub struct Broker {
    pub sessions: SessionRegistry,
    pub functions: FunctionRegistry,
    call_timeout: Duration,
    next_call_id: AtomicU64,
}

impl Broker {
    pub fn new(store: Arc<dyn CredentialStore>, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionRegistry::new(store),
            functions: FunctionRegistry::new(),
            call_timeout,
            next_call_id: AtomicU64::new(1),
        })
    }

    /// Register `function` as served by `owner`
    pub fn post(&self, owner: &str, function: &str) -> Result<(), PostError> {
        if function.is_empty() {
            return Err(PostError::EmptyName);
        }
        if !self.functions.register(function, owner) {
            return Err(PostError::AlreadyBound);
        }
        info!(login = owner, func = function, "Function registered");
        Ok(())
    }

    /// Run one call round trip on behalf of `caller`
    pub async fn call(&self, caller: &str, function: &str, data: Bytes) -> Result<Bytes, CallError> {
        let handler_login = self
            .functions
            .resolve(function)
            .ok_or_else(|| CallError::NotRegistered(function.to_string()))?;
        if handler_login == caller {
            return Err(CallError::OwnFunction(function.to_string()));
        }
        let handler = self
            .sessions
            .lookup(&handler_login)
            .ok_or_else(|| CallError::NotRegistered(function.to_string()))?;

        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (reply, answer) = oneshot::channel();
        let call = PendingCall {
            id,
            caller: caller.to_string(),
            function: function.to_string(),
            data,
            reply,
        };
        debug!(call_id = id, caller, func = function, handler = %handler_login, "Dispatching call");

        let round_trip = async {
            handler
                .dispatch(call)
                .await
                .map_err(|_| CallError::HandlerGone)?;
            drop(handler);
            answer.await.map_err(|_| CallError::HandlerGone)
        };

        match tokio::time::timeout(self.call_timeout, round_trip).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    warn!(call_id = id, func = function, error = %e, "Call failed");
                }
                result
            }
            Err(_) => {
                warn!(call_id = id, func = function, timeout = ?self.call_timeout, "Call timed out");
                Err(CallError::TimedOut)
            }
        }
    }

    /// Forget everything owned by `login`
    pub fn disconnect(&self, login: &str) {
        let released = self.functions.unregister_owned_by(login);
        if !released.is_empty() {
            debug!(login, functions = ?released, "Released functions");
        }
        self.sessions.remove(login);
    }
}

/// Relays calls to one handler connection and its DONE replies back.
///
/// Runs from READY until the connection's read loop drops `replies`.
pub struct ReadyWorker {
    login: String,
    calls: mpsc::Receiver<PendingCall>,
    replies: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Bytes>,
}

impl ReadyWorker {
    pub fn new(
        login: String,
        calls: mpsc::Receiver<PendingCall>,
        replies: mpsc::Receiver<Bytes>,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            login,
            calls,
            replies,
            outbound,
        }
    }

    pub async fn run(mut self) {
        let mut in_flight: Option<PendingCall> = None;

        loop {
            // Abandonment is checked first so a late reply never lands on
            // a call whose caller already gave up
            tokio::select! {
                biased;

                () = abandoned(&mut in_flight) => {
                    if let Some(call) = in_flight.take() {
                        warn!(login = %self.login, call_id = call.id, "Caller stopped waiting, dropping call");
                    }
                }
                answer = self.replies.recv() => {
                    let Some(answer) = answer else { break };
                    match in_flight.take() {
                        Some(call) => {
                            let id = call.id;
                            if call.reply.send(answer).is_err() {
                                debug!(call_id = id, "Caller left before the reply arrived");
                            } else {
                                debug!(call_id = id, "Call completed");
                            }
                        }
                        None => {
                            warn!(login = %self.login, "Reply without a call in flight");
                            if self.outbound.send(Response::error(NO_PENDING_CALL)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                call = self.calls.recv(), if in_flight.is_none() => {
                    let Some(mut call) = call else { break };
                    trace!(login = %self.login, call_id = call.id, caller = %call.caller, func = %call.function, "Sending compute request");

                    // The handler's queue may be full; stop waiting once the caller does
                    let frame = Response::compute(&call.data);
                    let sent = tokio::select! {
                        biased;

                        () = call.reply.closed() => None,
                        sent = self.outbound.send(frame) => Some(sent.is_ok()),
                    };
                    match sent {
                        Some(true) => in_flight = Some(call),
                        Some(false) => break,
                        None => debug!(call_id = call.id, "Caller gave up before dispatch"),
                    }
                }
            }
        }

        debug!(login = %self.login, "Ready worker stopped");
    }
}

/// Resolves once the caller of the in-flight call stops waiting
async fn abandoned(in_flight: &mut Option<PendingCall>) {
    match in_flight {
        Some(call) => call.reply.closed().await,
        None => std::future::pending().await,
    }
}
