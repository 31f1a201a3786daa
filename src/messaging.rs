//! Direct and broadcast message delivery between sessions.

use crate::protocol::Response;
use crate::registry::SessionRegistry;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a direct message waits for room in the receiver's queue
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a direct message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No live session for the receiver, or it stopped reading. Not a protocol fault.
    ReceiverOffline,
}

/// Deliver `text` to `receiver`, tagged with `sender` as its origin
pub async fn send_direct(
    sessions: &SessionRegistry,
    sender: &str,
    receiver: &str,
    text: &str,
) -> Delivery {
    let Some(session) = sessions.lookup(receiver) else {
        debug!(sender, receiver, "Receiver is not logged in");
        return Delivery::ReceiverOffline;
    };

    match tokio::time::timeout(DELIVERY_TIMEOUT, session.deliver(Response::direct(sender, text))).await {
        Ok(true) => {
            debug!(sender, receiver, "Message delivered");
            Delivery::Delivered
        }
        Ok(false) => {
            // Receiver's writer stopped but its read loop has not cleaned up yet
            debug!(sender, receiver, "Receiver connection is closing");
            Delivery::ReceiverOffline
        }
        Err(_) => {
            warn!(sender, receiver, peer = %session.peer(), "Receiver queue stayed full, message dropped");
            Delivery::ReceiverOffline
        }
    }
}

/// Deliver `payload` to every session except `sender`'s, without waiting.
///
/// Returns the number of sessions the payload was queued for.
pub fn broadcast(sessions: &SessionRegistry, sender: &str, payload: &[u8]) -> usize {
    let frame = Response::broadcast(payload);
    let mut delivered = 0;
    for session in sessions.others(sender) {
        if session.try_deliver(frame.clone()) {
            delivered += 1;
        } else {
            warn!(sender, receiver = session.login(), peer = %session.peer(), "Dropped broadcast, receiver queue full or closed");
        }
    }
    debug!(sender, delivered, "Broadcast sent");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryStore;
    use crate::registry::Session;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn join(sessions: &SessionRegistry, login: &str) -> mpsc::Receiver<Bytes> {
        let (outbound, rx) = mpsc::channel(4);
        let (calls, _) = mpsc::channel(1);
        sessions.sign_up(login, "pw").await.unwrap();
        sessions
            .sign_in(
                Session::new(login.to_string(), "127.0.0.1:9".parse().unwrap(), outbound, calls),
                "pw",
            )
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_direct_message_is_tagged_with_sender() {
        let sessions = SessionRegistry::new(Arc::new(MemoryStore::new()));
        let _alice = join(&sessions, "alice").await;
        let mut bob = join(&sessions, "bob").await;

        assert_eq!(
            send_direct(&sessions, "alice", "bob", "hi").await,
            Delivery::Delivered
        );
        assert_eq!(
            &bob.recv().await.unwrap()[..],
            b"M{\"from\":\"alice\",\"msg\":\"hi\"}\n"
        );
    }

    #[tokio::test]
    async fn test_direct_message_to_offline_receiver() {
        let sessions = SessionRegistry::new(Arc::new(MemoryStore::new()));
        let _alice = join(&sessions, "alice").await;

        assert_eq!(
            send_direct(&sessions, "alice", "carol", "hi").await,
            Delivery::ReceiverOffline
        );
        assert_eq!(sessions.len(), 1);
        assert!(sessions.lookup("carol").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_message_to_stalled_receiver() {
        let sessions = SessionRegistry::new(Arc::new(MemoryStore::new()));
        let _alice = join(&sessions, "alice").await;
        // Bob never drains his queue of four
        let _bob = join(&sessions, "bob").await;

        for _ in 0..4 {
            assert_eq!(
                send_direct(&sessions, "alice", "bob", "hi").await,
                Delivery::Delivered
            );
        }

        let started = tokio::time::Instant::now();
        assert_eq!(
            send_direct(&sessions, "alice", "bob", "hi").await,
            Delivery::ReceiverOffline
        );
        assert!(started.elapsed() >= DELIVERY_TIMEOUT);
        assert!(sessions.lookup("bob").is_some());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let sessions = SessionRegistry::new(Arc::new(MemoryStore::new()));
        let mut alice = join(&sessions, "alice").await;
        let mut bob = join(&sessions, "bob").await;
        let mut carol = join(&sessions, "carol").await;

        assert_eq!(broadcast(&sessions, "alice", b"hello all"), 2);
        assert_eq!(&bob.recv().await.unwrap()[..], b"Mhello all\n");
        assert_eq!(&carol.recv().await.unwrap()[..], b"Mhello all\n");
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_drops_for_closed_receiver() {
        let sessions = SessionRegistry::new(Arc::new(MemoryStore::new()));
        let _alice = join(&sessions, "alice").await;
        drop(join(&sessions, "bob").await);

        assert_eq!(broadcast(&sessions, "alice", b"x"), 0);
    }
}
