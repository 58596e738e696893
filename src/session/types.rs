// Session types

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Storage keys for persisted session state
pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USER_KEY: &str = "user";

/// Access/refresh token pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    /// Not every grant issues a refresh token
    pub refresh_token: Option<String>,
}

/// Role carried in the user profile
///
/// The session layer stores it opaquely; callers use it to pick a dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Doctor,
    Patient,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Doctor => "doctor",
            UserRole::Patient => "patient",
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(UserRole::Admin),
            "doctor" => Ok(UserRole::Doctor),
            "patient" => Ok(UserRole::Patient),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Authenticated user's profile
///
/// Fields beyond the ones named here are kept in `extra` so a profile
/// survives persistence unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    /// Parsed role, `None` when absent or not one of the known roles
    pub fn user_role(&self) -> Option<UserRole> {
        self.role.as_deref().and_then(|r| r.parse().ok())
    }
}

/// Current credentials and profile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub credentials: Option<CredentialPair>,
    pub user: Option<UserProfile>,
}

impl Session {
    /// Authenticated iff both an access token and a profile are present
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some() && self.user.is_some()
    }
}

/// Tokens and profile issued by login, signup or refresh
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

/// `data` payload of an auth response
#[derive(Debug, Deserialize)]
pub struct AuthData {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

impl AuthData {
    /// Convert into a grant, rejecting a missing or empty access token
    pub fn into_grant(self) -> Result<TokenGrant, String> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "response does not contain access_token".to_string())?;

        Ok(TokenGrant {
            access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            user: self.user,
        })
    }
}

/// Standard response wrapper used by every backend endpoint
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    pub data: Option<T>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl<T> ApiEnvelope<T> {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Login request body
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Signup request body
#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

impl SignupRequest {
    /// Check the rules the backend enforces before sending anything
    pub fn validate(&self) -> Result<(), String> {
        let name_len = self.name.trim().chars().count();
        if !(2..=100).contains(&name_len) {
            return Err("Name must be between 2 and 100 characters".to_string());
        }
        if !self.email.contains('@') {
            return Err("Email address is invalid".to_string());
        }

        let password = &self.password;
        if password.chars().count() < 8 || password.chars().count() > 100 {
            return Err("Password must be between 8 and 100 characters".to_string());
        }
        if !password.chars().any(|c| c.is_uppercase()) {
            return Err("Password must contain uppercase letter".to_string());
        }
        if !password.chars().any(|c| c.is_lowercase()) {
            return Err("Password must contain lowercase letter".to_string());
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            return Err("Password must contain digit".to_string());
        }

        Ok(())
    }
}

/// Pull a human readable message out of an error body
///
/// Understands `{"detail": "..."}`, `{"detail": [{"msg": "..."}]}`,
/// `{"error": "..."}` and `{"message": "..."}`; falls back to the raw text.
pub fn error_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };

    match json.get("detail") {
        Some(Value::String(detail)) => return detail.clone(),
        Some(Value::Array(items)) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            if !messages.is_empty() {
                return messages.join("; ");
            }
        }
        _ => {}
    }

    ["error", "message"]
        .iter()
        .find_map(|key| json.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}

/// Timestamps arrive either as RFC 3339 or as naive ISO 8601 (UTC implied);
/// anything unparseable is dropped rather than failing the whole envelope
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| parse_timestamp(&s)))
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
