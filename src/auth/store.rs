// Persistent token storage
//
// Three fixed keys (access token, refresh token, cached user) in a key/value
// table. Every mutation is committed before the call returns.

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::types::{StoredSession, TokenKind, User};
use crate::error::Result;

/// Durable key/value storage for the session tokens
///
/// Values are opaque; nothing here validates token contents. The session
/// methods see and replace all three entries under one lock, so a reader
/// never observes half of a write.
pub trait TokenStore: Send + Sync {
    fn get(&self, kind: TokenKind) -> Result<Option<String>>;

    fn set(&self, kind: TokenKind, value: &str) -> Result<()>;

    fn clear(&self, kind: TokenKind) -> Result<()>;

    /// Read all three entries
    ///
    /// A stored user that no longer parses reads back as absent.
    fn read_session(&self) -> Result<StoredSession>;

    /// Write all three entries as one unit. Absent fields are removed.
    fn write_session(&self, session: &StoredSession) -> Result<()>;

    /// Read-modify-write of the whole session as one unit
    ///
    /// `update` gets the current session and returns the session to store,
    /// or `None` to leave the store untouched. Returns what was written.
    fn update_session(
        &self,
        update: &mut dyn FnMut(StoredSession) -> Option<StoredSession>,
    ) -> Result<Option<StoredSession>>;

    fn clear_all(&self) -> Result<()> {
        self.write_session(&StoredSession::default())
    }
}

type Entries = HashMap<TokenKind, String>;

/// Storage form of a session: one optional value per key
fn encode_session(session: &StoredSession) -> Result<[(TokenKind, Option<String>); 3]> {
    let user = session.user.as_ref().map(encode_user).transpose()?;
    Ok([
        (TokenKind::Access, session.access_token.clone()),
        (TokenKind::Refresh, session.refresh_token.clone()),
        (TokenKind::User, user),
    ])
}

fn decode_session(entries: &Entries) -> StoredSession {
    StoredSession {
        access_token: entries.get(&TokenKind::Access).cloned(),
        refresh_token: entries.get(&TokenKind::Refresh).cloned(),
        user: entries.get(&TokenKind::User).and_then(|raw| decode_user(raw)),
    }
}

fn encode_user(user: &User) -> Result<String> {
    Ok(serde_json::to_string(user).context("Failed to serialize user data")?)
}

fn decode_user(raw: &str) -> Option<User> {
    match serde_json::from_str(raw) {
        Ok(user) => Some(user),
        Err(e) => {
            tracing::warn!("Could not parse stored user data: {}", e);
            None
        }
    }
}

/// Token store backed by a SQLite `auth_kv` table
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

impl SqliteTokenStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create token store directory: {}", parent.display())
            })?;
        }

        tracing::debug!("Opening token store: {}", path.display());
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Store that lives only as long as this value
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const UPSERT_SQL: &str = "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
     ON CONFLICT(key) DO UPDATE SET value = excluded.value";

const DELETE_SQL: &str = "DELETE FROM auth_kv WHERE key = ?";

/// All known keys in one statement
fn load_entries(conn: &Connection) -> Result<Entries> {
    let mut stmt = conn.prepare("SELECT key, value FROM auth_kv")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut entries = Entries::new();
    for row in rows {
        let (key, value) = row?;
        if let Some(kind) = TokenKind::from_key(&key) {
            entries.insert(kind, value);
        }
    }
    Ok(entries)
}

fn store_entries(conn: &Connection, session: &StoredSession) -> Result<()> {
    for (kind, value) in encode_session(session)? {
        match value {
            Some(v) => conn.execute(UPSERT_SQL, params![kind.key(), v])?,
            None => conn.execute(DELETE_SQL, [kind.key()])?,
        };
    }
    Ok(())
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, kind: TokenKind) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [kind.key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, kind: TokenKind, value: &str) -> Result<()> {
        self.conn().execute(UPSERT_SQL, params![kind.key(), value])?;
        Ok(())
    }

    fn clear(&self, kind: TokenKind) -> Result<()> {
        self.conn().execute(DELETE_SQL, [kind.key()])?;
        Ok(())
    }

    fn read_session(&self) -> Result<StoredSession> {
        let entries = load_entries(&self.conn())?;
        Ok(decode_session(&entries))
    }

    fn write_session(&self, session: &StoredSession) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        store_entries(&tx, session)?;
        tx.commit()?;
        Ok(())
    }

    fn update_session(
        &self,
        update: &mut dyn FnMut(StoredSession) -> Option<StoredSession>,
    ) -> Result<Option<StoredSession>> {
        let mut conn = self.conn();
        // Immediate: take the write lock before reading, so another process
        // cannot slip a write in between
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = decode_session(&load_entries(&tx)?);

        let Some(next) = update(current) else {
            return Ok(None);
        };
        store_entries(&tx, &next)?;
        tx.commit()?;
        Ok(Some(next))
    }
}

/// Process-local token store
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: Mutex<Entries>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `session`
    pub fn with_session(session: &StoredSession) -> Result<Self> {
        let store = Self::new();
        store.write_session(session)?;
        Ok(store)
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn replace_entries(entries: &mut Entries, session: &StoredSession) -> Result<()> {
    for (kind, value) in encode_session(session)? {
        match value {
            Some(v) => entries.insert(kind, v),
            None => entries.remove(&kind),
        };
    }
    Ok(())
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, kind: TokenKind) -> Result<Option<String>> {
        Ok(self.entries().get(&kind).cloned())
    }

    fn set(&self, kind: TokenKind, value: &str) -> Result<()> {
        self.entries().insert(kind, value.to_string());
        Ok(())
    }

    fn clear(&self, kind: TokenKind) -> Result<()> {
        self.entries().remove(&kind);
        Ok(())
    }

    fn read_session(&self) -> Result<StoredSession> {
        Ok(decode_session(&self.entries()))
    }

    fn write_session(&self, session: &StoredSession) -> Result<()> {
        replace_entries(&mut self.entries(), session)
    }

    fn update_session(
        &self,
        update: &mut dyn FnMut(StoredSession) -> Option<StoredSession>,
    ) -> Result<Option<StoredSession>> {
        let mut entries = self.entries();
        let Some(next) = update(decode_session(&entries)) else {
            return Ok(None);
        };
        replace_entries(&mut entries, &next)?;
        Ok(Some(next))
    }
}
