//! SQLite implementation of [`VaultStore`].
//!
//! A single connection sits behind a mutex, so every statement (and every
//! transaction) runs with exclusive access. That mutex is what serialises
//! concurrent token writes.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::{
    normalize_name, NewProject, Project, StoreError, StoreResult, Token, TokenWrite, VaultStore,
    DEFAULT_TOKEN_TYPE,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const PROJECT_SELECT: &str =
    "SELECT id, name, port, api_base_url, description, created_at, updated_at FROM projects";

const TOKEN_SELECT: &str = "SELECT t.id, t.project_id, p.name, t.token_value, t.token_type, \
     t.expires_at, t.created_at, t.updated_at \
     FROM tokens t INNER JOIN projects p ON t.project_id = p.id";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database file, creating missing parent
    /// directories and applying the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::initialize_connection(&conn)?;
        tracing::debug!(
            "opened token store at {} (journal_mode={journal_mode})",
            path.display()
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_connection(conn: &Connection) -> StoreResult<()> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl VaultStore for SqliteStore {
    fn find_project_by_name(&self, name: &str) -> StoreResult<Option<Project>> {
        let conn = self.lock()?;
        project_by_name(&conn, name.trim())
    }

    fn find_project_by_id(&self, id: i64) -> StoreResult<Option<Project>> {
        let conn = self.lock()?;
        let project = conn
            .query_row(
                &format!("{PROJECT_SELECT} WHERE id = ?1"),
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    fn find_project_by_port(&self, port: u16) -> StoreResult<Option<Project>> {
        if port == 0 {
            return Ok(None);
        }

        let conn = self.lock()?;
        let project = conn
            .query_row(
                &format!("{PROJECT_SELECT} WHERE port = ?1 ORDER BY id LIMIT 1"),
                params![port],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{PROJECT_SELECT} ORDER BY name, id"))?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    fn save_project(&self, project: NewProject) -> StoreResult<Project> {
        let name = normalize_name(&project.name)?;
        let now = Utc::now();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO projects (name, port, api_base_url, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(name) DO UPDATE SET
                port = excluded.port,
                api_base_url = excluded.api_base_url,
                description = excluded.description,
                updated_at = excluded.updated_at",
            params![
                name,
                project.port,
                project.api_base_url,
                project.description,
                now
            ],
        )?;

        project_by_name(&conn, name)?
            .ok_or(StoreError::Database(rusqlite::Error::QueryReturnedNoRows))
    }

    fn delete_project(&self, id: i64) -> StoreResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn upsert_token(&self, project_name: &str, token_value: &str) -> StoreResult<TokenWrite> {
        let name = normalize_name(project_name)?;
        let now = Utc::now();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO projects (name, port, created_at, updated_at)
             VALUES (?1, 0, ?2, ?2)",
            params![name, now],
        )?;
        let project_id: i64 = tx.query_row(
            "SELECT id FROM projects WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;

        let superseded = tx.execute(
            "DELETE FROM tokens WHERE project_id = ?1",
            params![project_id],
        )?;
        tx.execute(
            "INSERT INTO tokens (project_id, token_value, token_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![project_id, token_value, DEFAULT_TOKEN_TYPE, now],
        )?;
        let token_id = tx.last_insert_rowid();

        tx.commit()?;

        let project_created = inserted > 0;
        if project_created {
            tracing::info!("auto-provisioned project '{}' (id {})", name, project_id);
        }
        tracing::debug!(
            "stored token {} for project '{}', superseded {} previous",
            token_id,
            name,
            superseded
        );

        Ok(TokenWrite {
            project_id,
            token_id,
            project_created,
        })
    }

    fn latest_token(&self, project_name: &str) -> StoreResult<Option<Token>> {
        let conn = self.lock()?;
        let token = conn
            .query_row(
                &format!(
                    "{TOKEN_SELECT} WHERE p.name = ?1 ORDER BY t.updated_at DESC, t.id DESC LIMIT 1"
                ),
                params![project_name.trim()],
                token_from_row,
            )
            .optional()?;
        Ok(token)
    }

    fn list_tokens(&self) -> StoreResult<Vec<Token>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{TOKEN_SELECT} ORDER BY t.updated_at DESC, t.id DESC"
        ))?;
        let tokens = stmt
            .query_map([], token_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    fn list_tokens_for_project(&self, project_id: i64) -> StoreResult<Vec<Token>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{TOKEN_SELECT} WHERE t.project_id = ?1 ORDER BY t.updated_at DESC, t.id DESC"
        ))?;
        let tokens = stmt
            .query_map(params![project_id], token_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    fn delete_token(&self, id: i64) -> StoreResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM tokens WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}

// `name` carries COLLATE NOCASE in the schema, so plain equality is
// case-insensitive.
fn project_by_name(conn: &Connection, name: &str) -> StoreResult<Option<Project>> {
    let project = conn
        .query_row(
            &format!("{PROJECT_SELECT} WHERE name = ?1"),
            params![name],
            project_from_row,
        )
        .optional()?;
    Ok(project)
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        port: row.get(2)?,
        api_base_url: row.get(3)?,
        description: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        project_id: row.get(1)?,
        project_name: row.get(2)?,
        token_value: row.get(3)?,
        token_type: row.get(4)?,
        expires_at: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
