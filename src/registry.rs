//! Session and function registries.
//!
//! `SessionRegistry` maps a login to its live session and enforces a single
//! active session per login. `FunctionRegistry` maps a function name to the
//! login that serves it. Each registry sits behind its own mutex; lookups
//! hand out `Arc` clones so no lock is held while a frame is delivered.

use crate::broker::PendingCall;
use crate::credentials::{CredentialStore, StoreError};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A signed-in connection as seen by other connections.
#[derive(Debug)]
pub struct Session {
    login: String,
    peer: SocketAddr,
    /// Frames queued for the connection's writer task
    outbound: mpsc::Sender<Bytes>,
    /// Single-slot channel feeding the session's ready-worker
    calls: mpsc::Sender<PendingCall>,
}

impl Session {
    pub fn new(
        login: String,
        peer: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        calls: mpsc::Sender<PendingCall>,
    ) -> Self {
        Self {
            login,
            peer,
            outbound,
            calls,
        }
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a frame, waiting for room. Returns `false` if the connection is gone.
    pub async fn deliver(&self, frame: Bytes) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Queue a frame without waiting. Returns `false` if it was dropped.
    pub fn try_deliver(&self, frame: Bytes) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Hand a call to this session's ready-worker, waiting for the slot.
    /// Gives the call back if the session is gone.
    pub async fn dispatch(&self, call: PendingCall) -> Result<(), PendingCall> {
        self.calls.send(call).await.map_err(|e| e.0)
    }
}

/// Sign-up and sign-in rejections
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("login must not be empty")]
    EmptyLogin,
    #[error("this login has already been taken")]
    LoginTaken,
    #[error("wrong login/pass")]
    InvalidCredentials,
    #[error("user is online already")]
    AlreadyActive,
    #[error("credential store unavailable")]
    Store(#[from] StoreError),
}

/// Live sessions keyed by login
pub struct SessionRegistry {
    store: Arc<dyn CredentialStore>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new login in the credential store
    pub async fn sign_up(&self, login: &str, password: &str) -> Result<(), AuthError> {
        if login.is_empty() {
            return Err(AuthError::EmptyLogin);
        }

        let store = Arc::clone(&self.store);
        let (login, password) = (login.to_string(), password.to_string());
        let inserted = tokio::task::spawn_blocking(move || store.insert(&login, &password))
            .await
            .map_err(|_| StoreError::Interrupted)??;

        if inserted {
            Ok(())
        } else {
            Err(AuthError::LoginTaken)
        }
    }

    /// Verify credentials and make `session` the active session for its login
    pub async fn sign_in(&self, session: Session, password: &str) -> Result<Arc<Session>, AuthError> {
        let store = Arc::clone(&self.store);
        let login = session.login.clone();
        let stored = tokio::task::spawn_blocking(move || store.lookup(&login))
            .await
            .map_err(|_| StoreError::Interrupted)??;

        match stored {
            Some(stored) if stored == password => {}
            _ => return Err(AuthError::InvalidCredentials),
        }

        let mut sessions = self.sessions();
        if sessions.contains_key(&session.login) {
            return Err(AuthError::AlreadyActive);
        }
        let session = Arc::new(session);
        sessions.insert(session.login.clone(), Arc::clone(&session));
        debug!(login = %session.login, active = sessions.len(), "Session registered");
        Ok(session)
    }

    /// Drop the session for `login`, if any
    pub fn remove(&self, login: &str) -> Option<Arc<Session>> {
        let removed = self.sessions().remove(login);
        if removed.is_some() {
            trace!(login, "Session removed");
        }
        removed
    }

    pub fn lookup(&self, login: &str) -> Option<Arc<Session>> {
        self.sessions().get(login).cloned()
    }

    /// Every active session except the one for `login`
    pub fn others(&self, login: &str) -> Vec<Arc<Session>> {
        self.sessions()
            .iter()
            .filter(|(key, _)| key.as_str() != login)
            .map(|(_, session)| Arc::clone(session))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }
}

/// Function name to owning login
#[derive(Default)]
pub struct FunctionRegistry {
    bindings: Mutex<HashMap<String, String>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `name` to `owner`. Fails if the name is already bound, even to `owner`.
    pub fn register(&self, name: &str, owner: &str) -> bool {
        let mut bindings = self.bindings();
        if bindings.contains_key(name) {
            return false;
        }
        bindings.insert(name.to_string(), owner.to_string());
        true
    }

    /// Remove every binding owned by `login`, returning the released names
    pub fn unregister_owned_by(&self, login: &str) -> Vec<String> {
        let mut bindings = self.bindings();
        let owned: Vec<String> = bindings
            .iter()
            .filter(|(_, owner)| owner.as_str() == login)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            bindings.remove(name);
        }
        owned
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        self.bindings().get(name).cloned()
    }
}
