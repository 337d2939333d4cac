use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::protocol;

/// Opaque identity of one accepted connection.
pub type ClientId = u64;

/// Channel feeding a connection's writer task. Sending fails once the writer
/// task has exited on a transport fault, which is how dead peers are
/// detected without a heartbeat.
pub type Outbox = mpsc::UnboundedSender<String>;

struct Session {
    name: String,
    outbox: Outbox,
}

/// The shared table of live sessions; the single source of truth for who is
/// online. All mutation is funneled through one internal lock, so concurrent
/// connection tasks observe a serializable ordering.
pub struct Registry {
    // Keyed by monotonically issued ids, so iteration order is join order.
    sessions: Mutex<BTreeMap<ClientId, Session>>,
    next_id: AtomicU64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    NameTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Failed,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Atomically checks `name` for uniqueness (case-sensitive exact match)
    /// and claims it for `id`. Callers guarantee a non-empty name — the
    /// framing layer never yields an empty line — and no further format
    /// validation is applied.
    pub async fn register(
        &self,
        id: ClientId,
        name: String,
        outbox: Outbox,
    ) -> Result<(), RegisterError> {
        debug_assert!(!name.is_empty(), "display names are never empty");
        let mut sessions = self.sessions.lock().await;

        if sessions.values().any(|session| session.name == name) {
            return Err(RegisterError::NameTaken);
        }

        sessions.insert(id, Session { name, outbox });
        Ok(())
    }

    /// Removes the session if present, returning its name. Idempotent; a
    /// second call for the same id is a no-op returning `None`.
    pub async fn unregister(&self, id: ClientId) -> Option<String> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id).map(|session| session.name)
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<ClientId> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .find(|(_, session)| session.name == name)
            .map(|(id, _)| *id)
    }

    /// Snapshot of all registered names in join order.
    pub async fn all_names(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|session| session.name.clone()).collect()
    }

    /// Attempts delivery to one specific session. `Failed` means the session
    /// is gone or its transport is broken; the caller should unregister it.
    pub async fn send_to(&self, id: ClientId, line: &str) -> SendOutcome {
        let sessions = self.sessions.lock().await;
        match sessions.get(&id) {
            Some(session) if session.outbox.send(line.to_string()).is_ok() => {
                SendOutcome::Delivered
            }
            _ => SendOutcome::Failed,
        }
    }

    /// Delivers `line` to every registered session. Failures are tolerated
    /// per recipient: each failed connection is unregistered after the
    /// delivery pass, and if any failed, a fresh presence update goes out to
    /// the survivors. Recipients are snapshotted first, so registrations and
    /// removals racing with an in-flight broadcast never corrupt iteration.
    pub async fn broadcast(&self, line: &str) {
        let mut payload = line.to_string();
        loop {
            let recipients: Vec<(ClientId, Outbox)> = {
                let sessions = self.sessions.lock().await;
                sessions
                    .iter()
                    .map(|(id, session)| (*id, session.outbox.clone()))
                    .collect()
            };

            let mut failed = Vec::new();
            for (id, outbox) in recipients {
                if outbox.send(payload.clone()).is_err() {
                    debug!(client = id, "failed to deliver broadcast");
                    failed.push(id);
                }
            }
            if failed.is_empty() {
                return;
            }

            {
                let mut sessions = self.sessions.lock().await;
                for id in &failed {
                    if let Some(session) = sessions.remove(id) {
                        warn!(client = id, name = %session.name, "reaped unreachable session");
                    }
                }
            }

            // The next pass carries the reduced presence list; it loops
            // again only if that delivery uncovers further dead peers.
            payload = protocol::user_list(&self.all_names().await);
        }
    }

    /// Broadcasts the full presence snapshot, sent on every join and leave.
    pub async fn broadcast_presence(&self) {
        let line = protocol::user_list(&self.all_names().await);
        self.broadcast(&line).await;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};

    fn outbox() -> (Outbox, UnboundedReceiver<String>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let registry = Registry::new();
        let (tx_a, _rx_a) = outbox();
        let (tx_b, _rx_b) = outbox();

        registry
            .register(registry.next_id(), "alice".into(), tx_a)
            .await
            .expect("first registration should pass");
        let result = registry
            .register(registry.next_id(), "alice".into(), tx_b)
            .await;

        assert_eq!(result, Err(RegisterError::NameTaken));
    }

    #[tokio::test]
    async fn concurrent_registrations_have_one_winner() {
        let registry = std::sync::Arc::new(Registry::new());
        let (tx_a, _rx_a) = outbox();
        let (tx_b, _rx_b) = outbox();
        let id_a = registry.next_id();
        let id_b = registry.next_id();

        let (res_a, res_b) = tokio::join!(
            registry.register(id_a, "alice".into(), tx_a),
            registry.register(id_b, "alice".into(), tx_b),
        );

        assert_ne!(res_a.is_ok(), res_b.is_ok(), "exactly one must win");
        assert_eq!(registry.all_names().await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_frees_the_name() {
        let registry = Registry::new();
        let (tx, _rx) = outbox();
        let id = registry.next_id();
        registry
            .register(id, "alice".into(), tx)
            .await
            .expect("register");

        assert_eq!(registry.unregister(id).await, Some("alice".to_string()));
        assert_eq!(registry.unregister(id).await, None);

        let (tx, _rx) = outbox();
        registry
            .register(registry.next_id(), "alice".into(), tx)
            .await
            .expect("name should be free after unregister");
    }

    #[tokio::test]
    async fn all_names_is_in_join_order() {
        let registry = Registry::new();
        for name in ["alice", "bob", "carol"] {
            let (tx, _rx) = outbox();
            registry
                .register(registry.next_id(), name.into(), tx)
                .await
                .expect("register");
        }

        assert_eq!(
            registry.all_names().await,
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]
        );
    }

    #[tokio::test]
    async fn send_to_reports_transport_state() {
        let registry = Registry::new();
        let (tx, mut rx) = outbox();
        let id = registry.next_id();
        registry.register(id, "alice".into(), tx).await.expect("register");

        assert_eq!(registry.send_to(id, "hi").await, SendOutcome::Delivered);
        assert_eq!(rx.recv().await.as_deref(), Some("hi"));

        drop(rx);
        assert_eq!(registry.send_to(id, "hi").await, SendOutcome::Failed);
        assert_eq!(registry.send_to(999, "hi").await, SendOutcome::Failed);
    }

    #[tokio::test]
    async fn broadcast_reaps_dead_peers_and_updates_presence_once() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, rx_b) = outbox();
        let (tx_c, mut rx_c) = outbox();
        registry
            .register(registry.next_id(), "alice".into(), tx_a)
            .await
            .expect("register alice");
        registry
            .register(registry.next_id(), "bob".into(), tx_b)
            .await
            .expect("register bob");
        registry
            .register(registry.next_id(), "carol".into(), tx_c)
            .await
            .expect("register carol");

        // Bob's writer task is gone; the broadcast should reap him.
        drop(rx_b);
        registry.broadcast("[alice]: hello").await;

        for rx in [&mut rx_a, &mut rx_c] {
            assert_eq!(rx.recv().await.as_deref(), Some("[alice]: hello"));
            assert_eq!(rx.recv().await.as_deref(), Some("!USER_LIST:alice,carol"));
            assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        }
        assert_eq!(
            registry.all_names().await,
            vec!["alice".to_string(), "carol".to_string()]
        );
    }

    #[tokio::test]
    async fn broadcast_tolerates_multiple_dead_peers() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, rx_b) = outbox();
        let (tx_c, rx_c) = outbox();
        registry
            .register(registry.next_id(), "alice".into(), tx_a)
            .await
            .expect("register alice");
        registry
            .register(registry.next_id(), "bob".into(), tx_b)
            .await
            .expect("register bob");
        registry
            .register(registry.next_id(), "carol".into(), tx_c)
            .await
            .expect("register carol");

        // Both dead peers are reaped in the same pass; the lone survivor
        // gets exactly one presence update afterwards.
        drop(rx_b);
        drop(rx_c);
        registry.broadcast("[alice]: hello").await;

        assert_eq!(rx_a.recv().await.as_deref(), Some("[alice]: hello"));
        assert_eq!(rx_a.recv().await.as_deref(), Some("!USER_LIST:alice"));
        assert_eq!(rx_a.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(registry.all_names().await, vec!["alice".to_string()]);
    }
}
