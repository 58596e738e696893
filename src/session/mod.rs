// Session module
// Owns credentials, the refresh protocol and the login/logout lifecycle

pub mod credentials;
mod manager;
pub mod refresh;
pub mod types;

pub use credentials::CredentialStore;
pub use manager::SessionManager;
pub use refresh::RefreshCoordinator;
pub use types::{
    ApiEnvelope, CredentialPair, LoginRequest, Session, SignupRequest, TokenGrant, UserProfile,
    UserRole,
};
