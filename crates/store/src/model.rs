use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// A local backend application the vault tracks tokens for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    /// Port the backend listens on. `0` when unknown, which is the case for
    /// projects created implicitly by an incoming token.
    pub port: u16,
    pub api_base_url: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`crate::VaultStore::save_project`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewProject {
    pub name: String,
    pub port: u16,
    pub api_base_url: Option<String>,
    pub description: Option<String>,
}

impl NewProject {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The current token of a project.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: i64,
    pub project_id: i64,
    pub project_name: String,
    #[serde(skip_serializing)]
    pub token_value: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }

    /// Display form of the token: short tokens are fully starred, longer ones
    /// keep ten characters on each side.
    pub fn masked_value(&self) -> String {
        mask(&self.token_value)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("project_name", &self.project_name)
            .field("token_value", &self.masked_value())
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Ids produced by [`crate::VaultStore::upsert_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenWrite {
    pub project_id: i64,
    pub token_id: i64,
    /// The project did not exist before this write.
    pub project_created: bool,
}

fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 20 {
        return "*".repeat(chars.len());
    }

    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 10..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(value: &str, expires_at: Option<DateTime<Utc>>) -> Token {
        let now = Utc::now();
        Token {
            id: 1,
            project_id: 1,
            project_name: "orders-api".into(),
            token_value: value.into(),
            token_type: DEFAULT_TOKEN_TYPE.into(),
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn short_tokens_are_fully_masked() {
        assert_eq!(token("abc123", None).masked_value(), "******");
        assert_eq!(token("", None).masked_value(), "");
        assert_eq!(token(&"x".repeat(20), None).masked_value(), "*".repeat(20));
    }

    #[test]
    fn long_tokens_keep_both_ends() {
        let value = "eyJhbGciOiJIUzI1NiJ9.payload.signature1234";
        assert_eq!(token(value, None).masked_value(), "eyJhbGciOi...nature1234");
    }

    #[test]
    fn expiry_requires_a_deadline_in_the_past() {
        let now = Utc::now();
        assert!(!token("t", None).is_expired_at(now));
        assert!(!token("t", Some(now + Duration::minutes(5))).is_expired_at(now));
        assert!(token("t", Some(now - Duration::seconds(1))).is_expired_at(now));
    }

    #[test]
    fn debug_and_json_never_expose_the_raw_value() {
        let secret = "super-secret-bearer-token-value";
        let token = token(secret, None);

        let debug = format!("{token:?}");
        assert!(!debug.contains(secret));

        let json = serde_json::to_string(&token).expect("serialize token");
        assert!(!json.contains(secret));
        assert!(json.contains("\"projectName\":\"orders-api\""));
    }

    #[test]
    fn new_project_builder_sets_optional_fields() {
        let project = NewProject::new("billing", 5000)
            .with_base_url("http://localhost:5000")
            .with_description("billing backend");
        assert_eq!(project.port, 5000);
        assert_eq!(project.api_base_url.as_deref(), Some("http://localhost:5000"));
        assert_eq!(project.description.as_deref(), Some("billing backend"));
    }
}
