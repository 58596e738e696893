// Token refresh: wire exchange and single-flight coordination

use parking_lot::Mutex;
use reqwest::{Client, Url};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::credentials::CredentialStore;
use super::types::{error_message, ApiEnvelope, AuthData, TokenGrant};
use crate::error::RefreshError;
use crate::events::{SessionEvent, Subscribers};

/// Path of the refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "/auth/refresh";

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

enum Entry {
    /// Caller runs the exchange with this refresh token
    Lead {
        refresh_token: String,
        replacing: Option<String>,
    },
    Wait(oneshot::Receiver<Result<String, RefreshError>>),
    /// Token was already replaced since the rejected request
    Current(String),
    /// The rejected token already went through a failed cycle
    Failed(RefreshError),
    NoRefreshToken,
}

enum RefreshState {
    Idle,
    /// An exchange is in flight; later callers queue here in arrival order
    Refreshing { waiters: Vec<Waiter> },
}

/// Outcome of the most recent failed cycle, keyed by the access token it
/// tried to replace
struct FailedCycle {
    token: String,
    error: RefreshError,
}

struct Inner {
    state: RefreshState,
    last_failure: Option<FailedCycle>,
}

impl Inner {
    /// Return to Idle and hand back the queued waiters
    fn take_waiters(&mut self) -> Vec<Waiter> {
        match std::mem::replace(&mut self.state, RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        }
    }
}

/// Ensures at most one refresh exchange is in flight
///
/// The first caller to ask for a refresh runs the exchange; everyone who
/// asks while it is running is queued and receives the same outcome. All
/// waiters of a cycle are settled before the next cycle may start.
pub struct RefreshCoordinator {
    inner: Mutex<Inner>,
    store: Arc<CredentialStore>,
    events: Arc<Subscribers<SessionEvent>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, events: Arc<Subscribers<SessionEvent>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RefreshState::Idle,
                last_failure: None,
            }),
            store,
            events,
        }
    }

    /// True while an exchange is in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(self.inner.lock().state, RefreshState::Refreshing { .. })
    }

    /// Obtain a fresh access token after `rejected_token` got a 401
    ///
    /// If the store already holds a different access token, a refresh has
    /// completed since the rejected request was sent and that token is
    /// returned without a new exchange. A token whose cycle already failed
    /// gets that cycle's error again. Any new failure clears the session.
    /// Subscribers hear about each cycle once, from the caller that ran it.
    ///
    /// If the caller running a cycle is dropped mid-exchange, its waiters
    /// start over and one of them leads the next cycle.
    pub async fn refresh<F, Fut>(
        &self,
        rejected_token: Option<&str>,
        exchange: F,
    ) -> Result<String, RefreshError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenGrant, RefreshError>>,
    {
        let (refresh_token, replacing) = loop {
            match self.enter(rejected_token) {
                Entry::Lead {
                    refresh_token,
                    replacing,
                } => break (refresh_token, replacing),
                Entry::Wait(rx) => match rx.await {
                    Ok(outcome) => return outcome,
                    Err(_) => {
                        tracing::debug!("Refresh cycle abandoned, re-entering");
                        continue;
                    }
                },
                Entry::Current(token) => return Ok(token),
                Entry::Failed(error) => return Err(error),
                Entry::NoRefreshToken => {
                    self.store.clear();
                    self.events.emit(&SessionEvent::Expired {
                        reason: RefreshError::NoRefreshToken,
                    });
                    return Err(RefreshError::NoRefreshToken);
                }
            }
        };

        let cycle = RefreshCycle {
            coordinator: self,
            finished: false,
        };

        tracing::info!("Refreshing access token...");
        let outcome = match exchange(refresh_token).await {
            Ok(grant) => {
                self.store.commit(&grant);
                tracing::info!("Access token refreshed");
                Ok(grant.access_token)
            }
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                self.store.clear();
                Err(e)
            }
        };

        cycle.finish(&outcome, replacing);

        match outcome {
            Ok(_) => self.events.emit(&SessionEvent::Refreshed),
            Err(ref reason) => self.events.emit(&SessionEvent::Expired {
                reason: reason.clone(),
            }),
        }
        outcome
    }

    /// Decide, under the state lock, whether this caller leads a new cycle,
    /// joins the running one, or needs no exchange at all
    fn enter(&self, rejected_token: Option<&str>) -> Entry {
        let mut inner = self.inner.lock();

        if let RefreshState::Refreshing { waiters } = &mut inner.state {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            tracing::debug!(queued = waiters.len(), "Refresh in flight, queued behind it");
            return Entry::Wait(rx);
        }

        let current = self.store.access_token();
        match (current.as_deref(), rejected_token, &inner.last_failure) {
            (Some(current), _, _) if rejected_token != Some(current) => {
                tracing::debug!("Access token already replaced, skipping refresh");
                return Entry::Current(current.to_string());
            }
            // Session still cleared by the cycle this token already went through
            (None, Some(rejected), Some(failure)) if failure.token == rejected => {
                tracing::debug!("Rejected token already failed to refresh");
                return Entry::Failed(failure.error.clone());
            }
            _ => {}
        }

        let Some(refresh_token) = self.store.refresh_token() else {
            tracing::warn!("Refresh requested without a refresh token");
            if let Some(rejected) = rejected_token {
                inner.last_failure = Some(FailedCycle {
                    token: rejected.to_string(),
                    error: RefreshError::NoRefreshToken,
                });
            }
            return Entry::NoRefreshToken;
        };

        inner.state = RefreshState::Refreshing {
            waiters: Vec::new(),
        };
        Entry::Lead {
            refresh_token,
            replacing: current,
        }
    }

    /// End the running cycle, remembering a failure against the token it
    /// tried to replace
    fn settle(
        &self,
        outcome: &Result<String, RefreshError>,
        replacing: Option<String>,
    ) -> Vec<Waiter> {
        let mut inner = self.inner.lock();
        inner.last_failure = match (outcome, replacing) {
            (Err(error), Some(token)) => Some(FailedCycle {
                token,
                error: error.clone(),
            }),
            _ => None,
        };
        inner.take_waiters()
    }
}

/// Settles a refresh cycle's waiters, even if the driving future is dropped
struct RefreshCycle<'a> {
    coordinator: &'a RefreshCoordinator,
    finished: bool,
}

impl RefreshCycle<'_> {
    fn finish(mut self, outcome: &Result<String, RefreshError>, replacing: Option<String>) {
        self.finished = true;
        let waiters = self.coordinator.settle(outcome, replacing);
        if !waiters.is_empty() {
            tracing::debug!(waiters = waiters.len(), "Releasing refresh waiters");
        }
        for waiter in waiters {
            // Receiver may have been dropped
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for RefreshCycle<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Dropping the senders wakes the waiters, which re-enter
        let waiters = self.coordinator.inner.lock().take_waiters();
        tracing::warn!(
            waiters = waiters.len(),
            "Refresh abandoned before completion, waiters will retry"
        );
    }
}

/// Exchange a refresh token for a new grant
///
/// The refresh token travels as a bearer credential. Anything other than a
/// 2xx response carrying `{"status": "success", "data": {...}}` with an
/// access token is a failure.
pub async fn exchange_refresh_token(
    client: &Client,
    url: &Url,
    refresh_token: &str,
) -> Result<TokenGrant, RefreshError> {
    tracing::debug!(url = %url, "Sending refresh request");

    let response = client
        .post(url.clone())
        .bearer_auth(refresh_token)
        .header("Content-Type", "application/json")
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(RefreshError::RefreshRejected {
            status: status.as_u16(),
            message: error_message(&body),
        });
    }

    let envelope: ApiEnvelope<AuthData> = serde_json::from_str(&body)
        .map_err(|e| RefreshError::MalformedRefreshResponse(e.to_string()))?;

    if !envelope.is_success() {
        return Err(RefreshError::RefreshRejected {
            status: status.as_u16(),
            message: envelope
                .message
                .unwrap_or_else(|| format!("status '{}'", envelope.status)),
        });
    }

    envelope
        .data
        .ok_or_else(|| RefreshError::MalformedRefreshResponse("response has no data".to_string()))?
        .into_grant()
        .map_err(RefreshError::MalformedRefreshResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::UserProfile;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn profile() -> UserProfile {
        serde_json::from_value(json!({"id": 1, "name": "Jo"})).unwrap()
    }

    fn logged_in_store() -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::new(Arc::new(MemoryStore::new())));
        store.set_credentials("A1", Some("R1"));
        store.set_user(&profile());
        store
    }

    fn coordinator_for(store: Arc<CredentialStore>) -> RefreshCoordinator {
        RefreshCoordinator::new(store, Arc::new(Subscribers::new()))
    }

    async fn no_exchange(_: String) -> Result<TokenGrant, RefreshError> {
        panic!("exchange must not run")
    }

    fn grant(access: &str, refresh: &str) -> TokenGrant {
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: Some(refresh.to_string()),
            user: Some(profile()),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let store = logged_in_store();
        let coordinator = Arc::new(coordinator_for(store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .refresh(Some("A1"), |refresh_token| async move {
                        assert_eq!(refresh_token, "R1");
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(grant("A2", "R2"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("A2".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.refresh_token().as_deref(), Some("R2"));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_failure_rejects_all_waiters_and_clears_session() {
        let store = logged_in_store();
        let events = Arc::new(Subscribers::new());
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = expired.clone();
        let _sub = events.subscribe(move |event: &SessionEvent| {
            if matches!(event, SessionEvent::Expired { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), events));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .refresh(Some("A1"), |_| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(RefreshError::RefreshRejected {
                            status: 403,
                            message: "revoked".to_string(),
                        })
                    })
                    .await
            }));
        }

        let expected = Err(RefreshError::RefreshRejected {
            status: 403,
            message: "revoked".to_string(),
        });
        for handle in handles {
            assert_eq!(handle.await.unwrap(), expected);
        }
        assert!(!store.is_authenticated());
        assert_eq!(store.refresh_token(), None);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_skips_exchange() {
        let store = Arc::new(CredentialStore::new(Arc::new(MemoryStore::new())));
        let coordinator = coordinator_for(store);

        let result = coordinator
            .refresh(None, no_exchange)
            .await;
        assert_eq!(result, Err(RefreshError::NoRefreshToken));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_clears_session() {
        let store = Arc::new(CredentialStore::new(Arc::new(MemoryStore::new())));
        store.set_credentials("A1", None);
        store.set_user(&profile());
        let coordinator = coordinator_for(store.clone());

        let result = coordinator.refresh(Some("A1"), no_exchange).await;
        assert_eq!(result, Err(RefreshError::NoRefreshToken));
        assert!(!store.is_authenticated());
        assert!(!coordinator.is_refreshing());

        // The coordinator stays usable once the session is cleared
        let again = coordinator.refresh(Some("A1"), no_exchange).await;
        assert_eq!(again, Err(RefreshError::NoRefreshToken));
    }

    #[tokio::test]
    async fn test_stale_rejection_reuses_current_token() {
        let store = logged_in_store();
        store.set_credentials("A2", Some("R2"));
        let coordinator = coordinator_for(store);

        let result = coordinator
            .refresh(Some("A1"), no_exchange)
            .await;
        assert_eq!(result, Ok("A2".to_string()));
    }

    #[tokio::test]
    async fn test_sequential_cycles_each_exchange() {
        let store = logged_in_store();
        let coordinator = coordinator_for(store.clone());

        let first = coordinator
            .refresh(Some("A1"), |_| async { Ok(grant("A2", "R2")) })
            .await;
        assert_eq!(first, Ok("A2".to_string()));

        let second = coordinator
            .refresh(Some("A2"), |refresh_token| async move {
                assert_eq!(refresh_token, "R2");
                Ok(grant("A3", "R3"))
            })
            .await;
        assert_eq!(second, Ok("A3".to_string()));
        assert_eq!(store.access_token().as_deref(), Some("A3"));
    }

    #[tokio::test]
    async fn test_dropped_leader_hands_cycle_to_waiter() {
        let store = logged_in_store();
        let coordinator = Arc::new(coordinator_for(store.clone()));

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .refresh(Some("A1"), |_| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(grant("A9", "R9"))
                    })
                    .await
            })
        };

        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .refresh(Some("A1"), |refresh_token| async move {
                        assert_eq!(refresh_token, "R1");
                        Ok(grant("A2", "R2"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();

        assert_eq!(waiter.await.unwrap(), Ok("A2".to_string()));
        assert!(!coordinator.is_refreshing());
        assert_eq!(store.access_token().as_deref(), Some("A2"));
        assert!(store.is_authenticated());
    }

    #[tokio::test]
    async fn test_late_rejection_after_failed_cycle_reuses_error() {
        let store = logged_in_store();
        let events = Arc::new(Subscribers::new());
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = expired.clone();
        let _sub = events.subscribe(move |event: &SessionEvent| {
            if matches!(event, SessionEvent::Expired { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let coordinator = RefreshCoordinator::new(store.clone(), events);

        let rejected = Err(RefreshError::RefreshRejected {
            status: 403,
            message: "revoked".to_string(),
        });
        let first = coordinator
            .refresh(Some("A1"), |_| async {
                Err(RefreshError::RefreshRejected {
                    status: 403,
                    message: "revoked".to_string(),
                })
            })
            .await;
        assert_eq!(first, rejected);

        // A request sent with A1 before the cycle whose 401 lands afterwards
        let late = coordinator.refresh(Some("A1"), no_exchange).await;
        assert_eq!(late, rejected);
        assert_eq!(expired.load(Ordering::SeqCst), 1);

        // A logged-out request still reports the missing refresh token
        let fresh = coordinator.refresh(None, no_exchange).await;
        assert_eq!(fresh, Err(RefreshError::NoRefreshToken));
        assert_eq!(expired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_memory_cleared_by_successful_cycle() {
        let store = logged_in_store();
        let coordinator = coordinator_for(store.clone());

        let failed = coordinator
            .refresh(Some("A1"), |_| async {
                Err(RefreshError::Transport("connection reset".to_string()))
            })
            .await;
        assert!(failed.is_err());

        // Logging in again with the same tokens starts over
        store.set_credentials("A1", Some("R1"));
        store.set_user(&profile());
        let refreshed = coordinator
            .refresh(Some("A1"), |_| async { Ok(grant("A2", "R2")) })
            .await;
        assert_eq!(refreshed, Ok("A2".to_string()));
    }
}
