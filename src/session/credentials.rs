// Credential store with write-through persistence

use parking_lot::RwLock;
use std::sync::Arc;

use super::types::{
    CredentialPair, Session, TokenGrant, UserProfile, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
    USER_KEY,
};
use crate::storage::KeyValueStore;

/// In-memory session fields, hydrated once from the backend
#[derive(Debug, Clone, Default)]
struct SessionState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    user: Option<UserProfile>,
}

impl SessionState {
    fn snapshot(&self) -> Session {
        Session {
            credentials: self.access_token.as_ref().map(|access| CredentialPair {
                access_token: access.clone(),
                refresh_token: self.refresh_token.clone(),
            }),
            user: self.user.clone(),
        }
    }
}

/// Single source of truth for the current tokens and user profile
///
/// Memory is authoritative for the lifetime of the process. Every mutation
/// is written through to the backend while the write lock is held, so the
/// persisted copy follows the same order as memory. Backend failures are
/// logged and swallowed.
pub struct CredentialStore {
    /// `None` until first access hydrates it from `backend`
    state: RwLock<Option<SessionState>>,

    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            state: RwLock::new(None),
            backend,
        }
    }

    /// Replace both tokens; an absent refresh token removes the persisted entry
    pub fn set_credentials(&self, access_token: &str, refresh_token: Option<&str>) {
        self.mutate(|state| {
            state.access_token = Some(access_token.to_string());
            state.refresh_token = refresh_token.map(str::to_string);
        });
        tracing::debug!(
            has_refresh_token = refresh_token.is_some(),
            "Credentials updated"
        );
    }

    /// Replace the user profile
    pub fn set_user(&self, user: &UserProfile) {
        self.mutate(|state| state.user = Some(user.clone()));
    }

    /// Replace credentials and, when the grant carries one, the profile,
    /// under a single lock acquisition
    pub fn commit(&self, grant: &TokenGrant) {
        self.mutate(|state| {
            state.access_token = Some(grant.access_token.clone());
            state.refresh_token = grant.refresh_token.clone();
            if let Some(ref user) = grant.user {
                state.user = Some(user.clone());
            }
        });
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(|state| state.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(|state| state.refresh_token.clone())
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.read(|state| state.user.clone())
    }

    /// Consistent copy of all session fields
    pub fn snapshot(&self) -> Session {
        self.read(SessionState::snapshot)
    }

    /// True iff both an access token and a user profile are present
    pub fn is_authenticated(&self) -> bool {
        self.read(|state| state.access_token.is_some() && state.user.is_some())
    }

    /// Wipe memory and persisted state
    ///
    /// Memory is replaced in one step under the write lock, so readers see
    /// either the full session or nothing.
    pub fn clear(&self) {
        let mut guard = self.state.write();
        *guard = Some(SessionState::default());

        if let Err(e) = self
            .backend
            .remove_all(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY])
        {
            tracing::warn!("Failed to clear persisted session: {}", e);
        }
        drop(guard);

        tracing::info!("Session cleared");
    }

    fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        {
            let guard = self.state.read();
            if let Some(ref state) = *guard {
                return f(state);
            }
        }

        let mut guard = self.state.write();
        let state = guard.get_or_insert_with(|| self.load());
        f(state)
    }

    fn mutate(&self, f: impl FnOnce(&mut SessionState)) {
        let mut guard = self.state.write();
        let state = guard.get_or_insert_with(|| self.load());
        f(state);

        self.persist(ACCESS_TOKEN_KEY, state.access_token.as_deref());
        self.persist(REFRESH_TOKEN_KEY, state.refresh_token.as_deref());

        let user_json = state
            .user
            .as_ref()
            .and_then(|user| match serde_json::to_string(user) {
                Ok(json) => Some(json),
                Err(e) => {
                    tracing::warn!("Failed to serialize user profile: {}", e);
                    None
                }
            });
        self.persist(USER_KEY, user_json.as_deref());
    }

    fn persist(&self, key: &str, value: Option<&str>) {
        let result = match value {
            Some(v) => self.backend.set(key, v),
            None => self.backend.remove(key),
        };

        if let Err(e) = result {
            tracing::warn!("Failed to persist '{}': {}", key, e);
        }
    }

    fn load(&self) -> SessionState {
        let access_token = self.load_key(ACCESS_TOKEN_KEY);
        let refresh_token = self.load_key(REFRESH_TOKEN_KEY);
        let user = self
            .load_key(USER_KEY)
            .and_then(|json| match serde_json::from_str(&json) {
                Ok(user) => Some(user),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable persisted user profile: {}", e);
                    None
                }
            });

        tracing::debug!(
            has_access_token = access_token.is_some(),
            has_refresh_token = refresh_token.is_some(),
            has_user = user.is_some(),
            "Hydrated session from storage"
        );

        SessionState {
            access_token,
            refresh_token,
            user,
        }
    }

    fn load_key(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to read persisted '{}': {}", key, e);
                None
            }
        }
    }
}
