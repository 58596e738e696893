// Health Session - Library root

pub mod config;
pub mod error;
pub mod events;
pub mod http_client;
pub mod session;
pub mod storage;

pub use error::{RefreshError, Result, SessionError};
pub use events::{SessionEvent, Subscription};
pub use http_client::{ApiClient, ApiRequest, UploadPart};
pub use session::SessionManager;
