//! Persistence for TokenVault.
//!
//! The store keeps a table of projects and, for each project, at most one
//! current token. Writing a token for a project replaces whatever token the
//! project held before; writing a token for an unknown project name creates
//! the project on the fly with port `0`.
//!
//! Project names are compared case-insensitively everywhere.

mod model;
mod sqlite;

pub use model::{NewProject, Project, Token, TokenWrite, DEFAULT_TOKEN_TYPE};
pub use sqlite::SqliteStore;

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    LockPoisoned,

    #[error("project name must not be empty")]
    EmptyProjectName,
}

/// Storage contract consumed by the broker.
///
/// Implementations are synchronous; async callers are expected to hop onto a
/// blocking thread before calling in.
pub trait VaultStore: Send + Sync {
    fn find_project_by_name(&self, name: &str) -> StoreResult<Option<Project>>;

    fn find_project_by_id(&self, id: i64) -> StoreResult<Option<Project>>;

    /// First project registered on `port`. Port `0` never matches.
    fn find_project_by_port(&self, port: u16) -> StoreResult<Option<Project>>;

    /// All projects ordered by name.
    fn list_projects(&self) -> StoreResult<Vec<Project>>;

    /// Creates the project, or updates port, base URL and description of the
    /// project that already carries this name.
    fn save_project(&self, project: NewProject) -> StoreResult<Project>;

    /// Removes the project together with its token. Returns `false` when no
    /// project had this id.
    fn delete_project(&self, id: i64) -> StoreResult<bool>;

    /// Stores `token_value` as the only token of `project_name`, creating the
    /// project if needed. Runs as a single transaction.
    fn upsert_token(&self, project_name: &str, token_value: &str) -> StoreResult<TokenWrite>;

    fn latest_token(&self, project_name: &str) -> StoreResult<Option<Token>>;

    /// All tokens, most recently updated first.
    fn list_tokens(&self) -> StoreResult<Vec<Token>>;

    fn list_tokens_for_project(&self, project_id: i64) -> StoreResult<Vec<Token>>;

    fn delete_token(&self, id: i64) -> StoreResult<bool>;
}

pub(crate) fn normalize_name(name: &str) -> StoreResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::EmptyProjectName);
    }
    Ok(trimmed)
}
