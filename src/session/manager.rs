use std::sync::Arc;

use super::credentials::CredentialStore;
use super::refresh::RefreshCoordinator;
use super::types::{LoginRequest, SignupRequest, TokenGrant, UserProfile};
use crate::config::{Config, Persistence};
use crate::error::{Result, SessionError};
use crate::events::{SessionEvent, Subscribers, Subscription};
use crate::http_client::ApiClient;
use crate::storage::{KeyValueStore, MemoryStore, SqliteStore};

pub const LOGIN_PATH: &str = "/auth/login";
pub const SIGNUP_PATH: &str = "/auth/signup";

/// Session manager
///
/// Built once by the application's composition root and shared by `Arc`
/// with whatever issues API calls. Owns the credential store, the
/// authenticated HTTP client and the session event subscribers.
pub struct SessionManager {
    store: Arc<CredentialStore>,
    api: ApiClient,
    events: Arc<Subscribers<SessionEvent>>,
}

impl SessionManager {
    /// Create a manager with the storage backend selected by `config`
    pub fn new(config: &Config) -> Result<Self> {
        let backend: Arc<dyn KeyValueStore> = match config.persistence {
            Persistence::Durable => {
                tracing::info!(
                    "Persisting session to: {}",
                    config.session_db_file.display()
                );
                Arc::new(SqliteStore::open(&config.session_db_file)?)
            }
            Persistence::MemoryOnly => {
                tracing::info!("Session kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        Self::with_backend(config, backend)
    }

    /// Create a manager over an explicit storage backend
    pub fn with_backend(config: &Config, backend: Arc<dyn KeyValueStore>) -> Result<Self> {
        let store = Arc::new(CredentialStore::new(backend));
        let events = Arc::new(Subscribers::new());
        let coordinator = RefreshCoordinator::new(store.clone(), events.clone());

        let api = ApiClient::new(
            store.clone(),
            coordinator,
            &config.api_base_url,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?;

        Ok(Self { store, api, events })
    }

    /// Authenticated HTTP client
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.store.user()
    }

    /// Listen for login, refresh, logout and expiry
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Exchange email and password for a session
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile> {
        tracing::info!("Logging in as {}", email);
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };

        let grant = self.api.authenticate(LOGIN_PATH, &request).await?;
        self.start_session(grant)
    }

    /// Register a new account and start its session
    pub async fn signup(&self, request: &SignupRequest) -> Result<UserProfile> {
        request.validate().map_err(SessionError::InvalidRequest)?;

        tracing::info!("Signing up {} as {}", request.email, request.role.as_str());
        let grant = self.api.authenticate(SIGNUP_PATH, request).await?;
        self.start_session(grant)
    }

    /// Drop the session locally
    pub fn logout(&self) {
        self.store.clear();
        tracing::info!("Logged out");
        self.events.emit(&SessionEvent::LoggedOut);
    }

    fn start_session(&self, grant: TokenGrant) -> Result<UserProfile> {
        let user = grant.user.clone().ok_or_else(|| {
            SessionError::InvalidResponse("auth response has no user".to_string())
        })?;

        self.store.commit(&grant);
        tracing::info!(
            role = user.role.as_deref().unwrap_or("unknown"),
            "Session started"
        );

        self.events.emit(&SessionEvent::LoggedIn { user: user.clone() });
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            api_base_url: "http://127.0.0.1:9".to_string(),
            persistence: Persistence::MemoryOnly,
            session_db_file: PathBuf::from("/tmp/unused.sqlite3"),
            http_connect_timeout: 1,
            http_request_timeout: 1,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_new_memory_only_starts_logged_out() {
        let manager = SessionManager::new(&test_config()).unwrap();
        assert!(!manager.is_authenticated());
        assert!(manager.current_user().is_none());
        assert_eq!(manager.api().base_url().as_str(), "http://127.0.0.1:9/");
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = test_config();
        config.api_base_url = "::nope".to_string();
        assert!(matches!(
            SessionManager::new(&config),
            Err(SessionError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_start_session_requires_user() {
        let manager = SessionManager::new(&test_config()).unwrap();
        let result = manager.start_session(TokenGrant {
            access_token: "a".to_string(),
            refresh_token: None,
            user: None,
        });
        assert!(matches!(result, Err(SessionError::InvalidResponse(_))));
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_signup_validation_happens_before_network() {
        let manager = SessionManager::new(&test_config()).unwrap();
        let request = SignupRequest {
            name: "Jo".to_string(),
            email: "jo@example.com".to_string(),
            password: "weak".to_string(),
            role: crate::session::UserRole::Patient,
            phone: None,
            date_of_birth: None,
            gender: None,
        };

        let result = manager.signup(&request).await;
        assert!(matches!(result, Err(SessionError::InvalidRequest(_))));
    }

    #[test]
    fn test_logout_emits_event() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let manager = SessionManager::new(&test_config()).unwrap();
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        let _sub = manager.subscribe(move |event| {
            if *event == SessionEvent::LoggedOut {
                flag.store(true, Ordering::SeqCst);
            }
        });

        manager.credentials().set_credentials("a", Some("r"));
        manager.logout();

        assert!(seen.load(Ordering::SeqCst));
        assert!(manager.credentials().access_token().is_none());
    }
}
