//! Per-connection protocol handling.
//!
//! Each accepted stream is split: a writer task owns the write half and
//! drains the connection's outbound queue, while the read loop decodes one
//! frame at a time and drives the connection through its states:
//!
//! ```text
//! Unauthenticated ──SIGNIN──▶ Authenticated ──READY──▶ Ready
//!        │                          │                    │
//!        └──────────── EOF / read error / fatal frame ───┴──▶ closed
//! ```
//!
//! Other sessions reach this connection only through its outbound queue, so
//! nothing outside the writer task touches the socket. Calls this connection
//! makes run as tasks of their own, so a ready connection keeps reading its
//! DONE frames while it waits on a call of its own.

use crate::broker::{Broker, PendingCall, ReadyWorker, CALL_SLOTS, NO_PENDING_CALL};
use crate::config::Config;
use crate::messaging::{self, Delivery};
use crate::protocol::{
    CalcQuery, Credentials, DirectMessage, Frame, ParseResult, Parser, PostQuery, Request,
    Response,
};
use crate::registry::{AuthError, Session};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Per-connection limits taken from the server configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_frame_size: usize,
    pub outbound_queue: usize,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            outbound_queue: config.outbound_queue,
        }
    }
}

/// Authentication state of a connection
#[derive(Debug)]
pub enum ConnState {
    Unauthenticated,
    Authenticated {
        login: String,
    },
    /// Serving calls; DONE payloads go to the ready-worker through `replies`
    Ready {
        login: String,
        replies: mpsc::Sender<Bytes>,
    },
}

impl ConnState {
    pub fn login(&self) -> Option<&str> {
        match self {
            ConnState::Unauthenticated => None,
            ConnState::Authenticated { login } | ConnState::Ready { login, .. } => Some(login),
        }
    }
}

/// Whether the read loop keeps going after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Handle a single client connection
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    settings: ConnectionSettings,
) -> std::io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let (outbound, queue) = mpsc::channel(settings.outbound_queue);
    tokio::spawn(write_loop(writer, queue, peer));

    let mut conn = Connection::new(peer, broker, outbound, settings.max_frame_size);
    let result = conn.read_loop(&mut reader).await;
    conn.close();
    result
}

/// Drain the outbound queue into the socket until every sender is gone
async fn write_loop<W>(mut writer: W, mut queue: mpsc::Receiver<Bytes>, peer: SocketAddr)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(%peer, error = %e, "Write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// State owned by one connection's read loop
pub struct Connection {
    peer: SocketAddr,
    broker: Arc<Broker>,
    outbound: mpsc::Sender<Bytes>,
    calls_tx: mpsc::Sender<PendingCall>,
    /// Handed to the ready-worker on READY
    calls_rx: Option<mpsc::Receiver<PendingCall>>,
    /// Calls this connection is waiting on, aborted on close
    outgoing: JoinSet<()>,
    state: ConnState,
    max_frame_size: usize,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        broker: Arc<Broker>,
        outbound: mpsc::Sender<Bytes>,
        max_frame_size: usize,
    ) -> Self {
        let (calls_tx, calls_rx) = mpsc::channel(CALL_SLOTS);
        debug!(%peer, "Connected");
        Self {
            peer,
            broker,
            outbound,
            calls_tx,
            calls_rx: Some(calls_rx),
            outgoing: JoinSet::new(),
            state: ConnState::Unauthenticated,
            max_frame_size,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &ConnState {
        &self.state
    }

    /// Read and dispatch frames until EOF, a read error, or a fatal frame
    pub async fn read_loop<R>(&mut self, reader: &mut R) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

        loop {
            match Parser::parse(&buffer, self.max_frame_size) {
                ParseResult::Complete(frame, consumed) => {
                    buffer.advance(consumed);
                    while self.outgoing.try_join_next().is_some() {}
                    if self.handle_frame(frame).await == Flow::Close {
                        return Ok(());
                    }
                }

                ParseResult::Skip(n) => buffer.advance(n),

                ParseResult::Incomplete => {
                    let n = reader.read_buf(&mut buffer).await?;
                    if n == 0 {
                        trace!(peer = %self.peer, "Connection closed by client");
                        return Ok(());
                    }
                }

                ParseResult::Error(e) => {
                    warn!(peer = %self.peer, error = %e, "Parse error");
                    self.reply(Response::error(&e.to_string())).await;
                    return Ok(());
                }
            }
        }
    }

    /// Unregister the session and release call state
    pub fn close(&mut self) {
        // Dropping a waiting call frees the handler serving it
        self.outgoing.abort_all();
        if let Some(login) = self.state.login() {
            self.broker.disconnect(login);
            info!(peer = %self.peer, login, active = self.broker.sessions.len(), "Disconnected");
        } else {
            debug!(peer = %self.peer, "Disconnected");
        }
        self.state = ConnState::Unauthenticated;
        self.calls_rx = None;
    }

    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        let request = match frame.decode() {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %self.peer, tag = %char::from(frame.tag).escape_debug(), error = %e, "Bad frame");
                self.reply(Response::error(&e.to_string())).await;
                return if e.is_fatal() { Flow::Close } else { Flow::Continue };
            }
        };
        trace!(peer = %self.peer, kind = request.kind(), len = frame.payload.len(), "Processing request");

        let login = self.state.login().map(str::to_owned);
        if login.is_none() && !request.is_authenticating() {
            warn!(peer = %self.peer, kind = request.kind(), "Request before sign-in");
            self.reply(Response::error("you should sign in first")).await;
            return Flow::Close;
        }
        let login = login.unwrap_or_default();

        match request {
            Request::SignUp(credentials) => self.sign_up(credentials).await,
            Request::SignIn(credentials) => self.sign_in(credentials).await,
            Request::Message(message) => self.message(&login, message).await,
            Request::Stream(payload) => self.stream(&login, &payload).await,
            Request::Post(query) => self.post(&login, query).await,
            Request::Calc(query) => self.calc(&login, query),
            Request::Ready => self.ready(login),
            Request::Done(answer) => self.done(answer).await,
        }
    }

    async fn sign_up(&mut self, credentials: Credentials) -> Flow {
        match self
            .broker
            .sessions
            .sign_up(&credentials.login, &credentials.pass)
            .await
        {
            Ok(()) => {
                info!(peer = %self.peer, login = %credentials.login, "Signed up");
                self.reply(Response::ok("Successfully signed up")).await;
            }
            Err(e) => self.auth_failed(&credentials.login, e).await,
        }
        Flow::Continue
    }

    async fn sign_in(&mut self, credentials: Credentials) -> Flow {
        if let Some(current) = self.state.login() {
            debug!(peer = %self.peer, login = current, "Sign-in on an authenticated connection");
            self.reply(Response::error("already signed in")).await;
            return Flow::Continue;
        }

        let session = Session::new(
            credentials.login.clone(),
            self.peer,
            self.outbound.clone(),
            self.calls_tx.clone(),
        );
        match self.broker.sessions.sign_in(session, &credentials.pass).await {
            Ok(_) => {
                info!(peer = %self.peer, login = %credentials.login, "Signed in");
                self.state = ConnState::Authenticated {
                    login: credentials.login,
                };
                self.reply(Response::ok("Successfully logged in")).await;
            }
            Err(e) => self.auth_failed(&credentials.login, e).await,
        }
        Flow::Continue
    }

    async fn auth_failed(&self, login: &str, e: AuthError) {
        match &e {
            AuthError::Store(cause) => {
                error!(peer = %self.peer, login, error = %cause, "Credential store failure");
            }
            _ => warn!(peer = %self.peer, login, error = %e, "Authentication rejected"),
        }
        self.reply(Response::error(&e.to_string())).await;
    }

    async fn message(&self, login: &str, message: DirectMessage) -> Flow {
        let sessions = &self.broker.sessions;
        match messaging::send_direct(sessions, login, &message.receiver, &message.text).await {
            Delivery::Delivered => self.reply(Response::ok("Message was sent")).await,
            Delivery::ReceiverOffline => {
                self.reply(Response::error("receiver is not logged in")).await
            }
        }
        Flow::Continue
    }

    async fn stream(&self, login: &str, payload: &[u8]) -> Flow {
        messaging::broadcast(&self.broker.sessions, login, payload);
        self.reply(Response::ok("Message was streamed")).await;
        Flow::Continue
    }

    async fn post(&self, login: &str, query: PostQuery) -> Flow {
        match self.broker.post(login, &query.function) {
            Ok(()) => self.reply(Response::ok("Function was registered")).await,
            Err(e) => {
                warn!(peer = %self.peer, login, func = %query.function, error = %e, "Registration rejected");
                self.reply(Response::error(&e.to_string())).await;
            }
        }
        Flow::Continue
    }

    fn calc(&mut self, login: &str, query: CalcQuery) -> Flow {
        let broker = Arc::clone(&self.broker);
        let outbound = self.outbound.clone();
        let caller = login.to_string();

        self.outgoing.spawn(async move {
            let frame = match broker.call(&caller, &query.function, query.data).await {
                Ok(answer) => Response::done(&answer),
                Err(e) => Response::error(&e.to_string()),
            };
            let _ = outbound.send(frame).await;
        });
        Flow::Continue
    }

    fn ready(&mut self, login: String) -> Flow {
        if matches!(self.state, ConnState::Ready { .. }) {
            trace!(peer = %self.peer, "Already ready");
            return Flow::Continue;
        }
        let Some(calls) = self.calls_rx.take() else {
            return Flow::Continue;
        };

        let (replies, replies_rx) = mpsc::channel(1);
        let worker = ReadyWorker::new(login.clone(), calls, replies_rx, self.outbound.clone());
        tokio::spawn(worker.run());

        info!(peer = %self.peer, login = %login, "Ready to handle calls");
        self.state = ConnState::Ready { login, replies };
        Flow::Continue
    }

    async fn done(&self, answer: Bytes) -> Flow {
        match &self.state {
            ConnState::Ready { replies, .. } => {
                if replies.send(answer).await.is_err() {
                    // Worker only stops when the connection's writer is gone
                    return Flow::Close;
                }
            }
            _ => self.reply(Response::error(NO_PENDING_CALL)).await,
        }
        Flow::Continue
    }

    /// Queue a frame for this connection's own writer
    async fn reply(&self, frame: Bytes) {
        if self.outbound.send(frame).await.is_err() {
            trace!(peer = %self.peer, "Writer gone, dropping reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialStore, MemoryStore, StoreError};
    use std::time::Duration;

    fn connection(broker: &Arc<Broker>) -> (Connection, mpsc::Receiver<Bytes>) {
        let (outbound, queue) = mpsc::channel(16);
        let conn = Connection::new(
            "127.0.0.1:40000".parse().unwrap(),
            Arc::clone(broker),
            outbound,
            1024,
        );
        (conn, queue)
    }

    fn broker() -> Arc<Broker> {
        Broker::new(Arc::new(MemoryStore::new()), Duration::from_secs(5))
    }

    fn drain(queue: &mut mpsc::Receiver<Bytes>) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(frame) = queue.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_sign_up_and_sign_in_flow() {
        let broker = broker();
        let (mut conn, mut queue) = connection(&broker);
        let mut input = tokio_test::io::Builder::new()
            .read(b"U{\"login\":\"alice\",\"pass\":\"pw1\"}\n")
            .read(b"U{\"login\":\"alice\",\"pass\":\"pw2\"}\r\n")
            .read(b"I{\"login\":\"alice\",\"pass\":\"pw2\"}\n")
            .read(b"I{\"login\":\"alice\",\"pass\":\"pw1\"}\n")
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(conn.state().login(), Some("alice"));

        let frames = drain(&mut queue);
        assert_eq!(
            frames,
            vec![
                Response::ok("Successfully signed up"),
                Response::error("this login has already been taken"),
                Response::error("wrong login/pass"),
                Response::ok("Successfully logged in"),
            ]
        );

        conn.close();
        assert!(broker.sessions.lookup("alice").is_none());
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let broker = broker();
        let (mut conn, mut queue) = connection(&broker);
        let mut input = tokio_test::io::Builder::new()
            .read(b"U{\"login\":")
            .read(b"\"bob\",\"pass\":\"x\"}")
            .read(b"\n")
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(drain(&mut queue), vec![Response::ok("Successfully signed up")]);
    }

    #[tokio::test]
    async fn test_request_before_sign_in_closes() {
        let broker = broker();
        let (mut conn, mut queue) = connection(&broker);
        // The second frame is never read
        let mut input = tokio_test::io::Builder::new()
            .read(b"P{\"func\":\"double\"}\nR\n")
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(
            drain(&mut queue),
            vec![Response::error("you should sign in first")]
        );
        assert!(broker.functions.resolve("double").is_none());
    }

    #[tokio::test]
    async fn test_malformed_payload_closes() {
        let broker = broker();
        let (mut conn, mut queue) = connection(&broker);
        let mut input = tokio_test::io::Builder::new()
            .read(b"Inot json\nU{\"login\":\"a\",\"pass\":\"b\"}\n")
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(
            drain(&mut queue),
            vec![Response::error("server can't unmarshal message content")]
        );
    }

    #[tokio::test]
    async fn test_unknown_tag_keeps_connection_open() {
        let broker = broker();
        let (mut conn, mut queue) = connection(&broker);
        let mut input = tokio_test::io::Builder::new()
            .read(b"Zhello\nU{\"login\":\"a\",\"pass\":\"b\"}\n")
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(
            drain(&mut queue),
            vec![
                Response::error("wrong message type"),
                Response::ok("Successfully signed up"),
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_closes() {
        let broker = broker();
        let (mut conn, mut queue) = connection(&broker);
        let mut input = tokio_test::io::Builder::new()
            .read(&vec![b'S'; 2048])
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(
            drain(&mut queue),
            vec![Response::error("frame exceeds 1024 bytes")]
        );
    }

    #[tokio::test]
    async fn test_ready_is_idempotent_and_done_without_call() {
        let broker = broker();
        broker.sessions.sign_up("h", "pw").await.unwrap();
        let (mut conn, mut queue) = connection(&broker);

        // DONE before READY is answered by the connection itself
        let mut input = tokio_test::io::Builder::new()
            .read(b"I{\"login\":\"h\",\"pass\":\"pw\"}\nDearly\nR\nR\n")
            .build();
        conn.read_loop(&mut input).await.unwrap();
        assert!(matches!(conn.state(), ConnState::Ready { .. }));
        assert_eq!(
            drain(&mut queue),
            vec![
                Response::ok("Successfully logged in"),
                Response::error(NO_PENDING_CALL),
            ]
        );

        // DONE after READY with nothing in flight is answered by the worker
        let mut input = tokio_test::io::Builder::new().read(b"Dstray\n").build();
        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(queue.recv().await.unwrap(), Response::error(NO_PENDING_CALL));
    }

    /// A store whose backend is unreachable
    struct BrokenStore;

    impl CredentialStore for BrokenStore {
        fn lookup(&self, _login: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn insert(&self, _login: &str, _password: &str) -> Result<bool, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[tokio::test]
    async fn test_store_failure_keeps_connection_open() {
        let broker = Broker::new(Arc::new(BrokenStore), Duration::from_secs(5));
        let (mut conn, mut queue) = connection(&broker);
        let mut input = tokio_test::io::Builder::new()
            .read(b"U{\"login\":\"a\",\"pass\":\"pw\"}\n")
            .read(b"I{\"login\":\"a\",\"pass\":\"pw\"}\n")
            .read(b"Zstill here\n")
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(conn.state().login(), None);
        assert_eq!(
            drain(&mut queue),
            vec![
                Response::error("credential store unavailable"),
                Response::error("credential store unavailable"),
                Response::error("wrong message type"),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_sign_in_on_same_connection() {
        let broker = broker();
        broker.sessions.sign_up("a", "pw").await.unwrap();
        broker.sessions.sign_up("b", "pw").await.unwrap();
        let (mut conn, mut queue) = connection(&broker);
        let mut input = tokio_test::io::Builder::new()
            .read(b"I{\"login\":\"a\",\"pass\":\"pw\"}\nI{\"login\":\"b\",\"pass\":\"pw\"}\n")
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(conn.state().login(), Some("a"));
        assert!(broker.sessions.lookup("b").is_none());
        assert_eq!(
            drain(&mut queue),
            vec![
                Response::ok("Successfully logged in"),
                Response::error("already signed in"),
            ]
        );
    }

    #[tokio::test]
    async fn test_close_releases_functions() {
        let broker = broker();
        broker.sessions.sign_up("h", "pw").await.unwrap();
        let (mut conn, mut queue) = connection(&broker);
        let mut input = tokio_test::io::Builder::new()
            .read(b"I{\"login\":\"h\",\"pass\":\"pw\"}\nP{\"func\":\"double\"}\nP{\"func\":\"double\"}\n")
            .build();

        conn.read_loop(&mut input).await.unwrap();
        assert_eq!(
            drain(&mut queue),
            vec![
                Response::ok("Successfully logged in"),
                Response::ok("Function was registered"),
                Response::error("function with this name already exists"),
            ]
        );
        assert_eq!(broker.functions.resolve("double").as_deref(), Some("h"));

        conn.close();
        assert!(broker.functions.resolve("double").is_none());
        assert!(broker.sessions.lookup("h").is_none());
    }
}
