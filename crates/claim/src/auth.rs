//! Client identity checks at the claimer
//!
//! Only identities listed in `authorized_clients` may issue commands. A
//! rejected identity is remembered: every later command from it is refused
//! without another lookup and without counting a second failure.

use crate::stats::IpcStatistics;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Rejected identities remembered at once
pub const MAX_DENIED_CLIENTS: usize = 1024;

/// Authorization outcome for one client id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Accepted now or earlier
    Accepted,
    /// Rejected on this attempt
    Denied,
    /// Rejected earlier, still rejected
    PreviouslyDenied,
}

impl AuthDecision {
    pub fn is_accepted(self) -> bool {
        self == AuthDecision::Accepted
    }
}

/// Insertion-ordered set that forgets its oldest entry when full
struct DeniedClients {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DeniedClients {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, client_id: &str) -> bool {
        self.ids.contains(client_id)
    }

    /// Returns false if the id was already present
    fn insert(&mut self, client_id: &str) -> bool {
        if self.ids.contains(client_id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
            debug!("Forgetting rejected client '{}'", oldest);
        }
        self.ids.insert(client_id.to_string());
        self.order.push_back(client_id.to_string());
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Allow-list authenticator with accepted/denied caches
pub struct ClientAuthenticator {
    authorized: HashSet<String>,
    accepted: RwLock<HashSet<String>>,
    denied: RwLock<DeniedClients>,
    stats: Arc<IpcStatistics>,
}

impl ClientAuthenticator {
    pub fn new<I, S>(authorized: I, stats: Arc<IpcStatistics>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_denied_capacity(authorized, stats, MAX_DENIED_CLIENTS)
    }

    /// Authenticator remembering at most `capacity` rejected identities
    pub fn with_denied_capacity<I, S>(
        authorized: I,
        stats: Arc<IpcStatistics>,
        capacity: usize,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            authorized: authorized.into_iter().map(Into::into).collect(),
            accepted: RwLock::new(HashSet::new()),
            denied: RwLock::new(DeniedClients::new(capacity)),
            stats,
        }
    }

    /// Check a client id, updating statistics on first contact
    pub async fn authenticate(&self, client_id: &str) -> AuthDecision {
        if self.denied.read().await.contains(client_id) {
            return AuthDecision::PreviouslyDenied;
        }
        if self.accepted.read().await.contains(client_id) {
            return AuthDecision::Accepted;
        }

        if constant_time_contains(&self.authorized, client_id) {
            if self.accepted.write().await.insert(client_id.to_string()) {
                self.stats.record_authenticated_client();
                info!("Client '{}' authenticated", client_id);
            }
            AuthDecision::Accepted
        } else {
            // Two concurrent first attempts must count one failure
            if self.denied.write().await.insert(client_id) {
                self.stats.record_authentication_failure();
                warn!("Client '{}' is not authorized, rejecting all its commands", client_id);
                AuthDecision::Denied
            } else {
                AuthDecision::PreviouslyDenied
            }
        }
    }

    /// Whether a client id has been rejected
    pub async fn is_denied(&self, client_id: &str) -> bool {
        self.denied.read().await.contains(client_id)
    }

    /// Number of rejected identities currently remembered
    pub async fn denied_count(&self) -> usize {
        self.denied.read().await.len()
    }
}

/// Compare against every entry so timing does not reveal which one matched
fn constant_time_contains(set: &HashSet<String>, candidate: &str) -> bool {
    set.iter()
        .fold(false, |found, entry| found | constant_time_compare(entry.as_bytes(), candidate.as_bytes()))
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_authorized_client_accepted_once() {
        let stats = Arc::new(IpcStatistics::new());
        let auth = ClientAuthenticator::new(["usbipd"], stats.clone());

        assert_eq!(auth.authenticate("usbipd").await, AuthDecision::Accepted);
        assert_eq!(auth.authenticate("usbipd").await, AuthDecision::Accepted);
        assert_eq!(stats.snapshot().authenticated_clients, 1);
    }

    #[tokio::test]
    async fn test_denial_is_permanent_and_counted_once() {
        let stats = Arc::new(IpcStatistics::new());
        let auth = ClientAuthenticator::new(["usbipd"], stats.clone());

        assert_eq!(auth.authenticate("bad-client").await, AuthDecision::Denied);
        assert_eq!(
            auth.authenticate("bad-client").await,
            AuthDecision::PreviouslyDenied
        );
        assert!(auth.is_denied("bad-client").await);
        assert_eq!(stats.authentication_failures(), 1);
    }

    #[tokio::test]
    async fn test_denied_memory_is_bounded() {
        let stats = Arc::new(IpcStatistics::new());
        let auth = ClientAuthenticator::with_denied_capacity(["usbipd"], stats.clone(), 8);

        for i in 0..100 {
            let id = format!("intruder-{}", i);
            assert_eq!(auth.authenticate(&id).await, AuthDecision::Denied);
        }
        assert_eq!(auth.denied_count().await, 8);
        assert!(auth.is_denied("intruder-99").await);
        assert!(!auth.is_denied("intruder-0").await);

        // Forgotten identities are still refused
        assert_eq!(auth.authenticate("intruder-0").await, AuthDecision::Denied);
        assert_eq!(
            auth.authenticate("intruder-99").await,
            AuthDecision::PreviouslyDenied
        );
        assert_eq!(auth.authenticate("usbipd").await, AuthDecision::Accepted);
        assert_eq!(auth.denied_count().await, 8);
        assert_eq!(stats.authentication_failures(), 101);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"usbipd", b"usbipd"));
        assert!(!constant_time_compare(b"usbipd", b"usbipe"));
        assert!(!constant_time_compare(b"usbipd", b"usbip"));
    }
}
