use std::path::Path;

use emberline_common::message::EntryRole;
use emberline_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

/// Hard cap on stored turns per (guild, user, model). Older rows are pruned
/// inside the same transaction that appends the new one.
pub const MAX_ENTRIES: usize = 30;

/// Persisted conversation row loaded from the store.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub role: EntryRole,
    pub content: String,
    pub author_name: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Persisted guild-level switches.
#[derive(Debug, Clone)]
pub struct GuildSettingsRow {
    pub guild_id: String,
    pub enabled: bool,
    pub model: String,
    pub model_locked: bool,
}

/// Per-user daily consumption counters. `reset_date` is a `%Y-%m-%d` UTC
/// date; the ledger rebases the row lazily when the date rolls over.
#[derive(Debug, Clone)]
pub struct QuotaRow {
    pub user_id: String,
    pub characters_used: u64,
    pub images_used: u64,
    pub reset_date: String,
}

impl QuotaRow {
    pub fn fresh(user_id: impl Into<String>, reset_date: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            characters_used: 0,
            images_used: 0,
            reset_date: reset_date.into(),
        }
    }
}

/// Persistent storage for conversations, quotas, and chat settings.
pub struct ChatStore {
    conn: Connection,
}

impl ChatStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening chat store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    guild_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    model TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    author_name TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_conversations_key
                    ON conversations(guild_id, user_id, model);

                CREATE TABLE IF NOT EXISTS guild_settings (
                    guild_id TEXT PRIMARY KEY,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    model TEXT NOT NULL,
                    model_locked INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS user_models (
                    user_id TEXT PRIMARY KEY,
                    model TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS limit_bypasses (
                    user_id TEXT PRIMARY KEY,
                    added_by TEXT,
                    added_at TEXT
                );

                CREATE TABLE IF NOT EXISTS global_blacklist (
                    user_id TEXT PRIMARY KEY,
                    reason TEXT,
                    added_by TEXT,
                    added_at TEXT
                );

                CREATE TABLE IF NOT EXISTS limit_overrides (
                    model TEXT PRIMARY KEY,
                    daily_limit INTEGER
                );

                CREATE TABLE IF NOT EXISTS user_quotas (
                    user_id TEXT PRIMARY KEY,
                    characters_used INTEGER NOT NULL DEFAULT 0,
                    images_used INTEGER NOT NULL DEFAULT 0,
                    reset_date TEXT NOT NULL
                );",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ---- conversations -----------------------------------------------------

    /// Append a turn and prune the log to the newest [`MAX_ENTRIES`] rows,
    /// atomically.
    pub fn append_entry(
        &self,
        guild_id: &str,
        user_id: &str,
        model: &str,
        role: EntryRole,
        content: &str,
        author_name: Option<&str>,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        tx.execute(
            "INSERT INTO conversations (id, guild_id, user_id, model, role, content, author_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid::Uuid::new_v4().to_string(),
                guild_id,
                user_id,
                model,
                role.as_str(),
                content,
                author_name,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to append entry: {e}")))?;

        tx.execute(
            "DELETE FROM conversations
             WHERE guild_id = ?1 AND user_id = ?2 AND model = ?3 AND rowid NOT IN (
                SELECT rowid FROM conversations
                WHERE guild_id = ?1 AND user_id = ?2 AND model = ?3
                ORDER BY rowid DESC LIMIT ?4
             )",
            params![guild_id, user_id, model, MAX_ENTRIES as i64],
        )
        .map_err(|e| Error::Database(format!("failed to prune entries: {e}")))?;

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit append: {e}")))?;
        Ok(())
    }

    /// Load the conversation in chronological order. Absent key yields an
    /// empty vec, never an error.
    pub fn load_conversation(
        &self,
        guild_id: &str,
        user_id: &str,
        model: &str,
    ) -> Result<Vec<StoredEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT role, content, author_name, created_at
                 FROM conversations
                 WHERE guild_id = ?1 AND user_id = ?2 AND model = ?3
                 ORDER BY rowid ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare conversation query: {e}")))?;

        let rows = stmt
            .query_map(params![guild_id, user_id, model], |row| {
                let role_raw: String = row.get(0)?;
                let created_raw: String = row.get(3)?;
                Ok(StoredEntry {
                    role: EntryRole::parse(&role_raw),
                    content: row.get(1)?,
                    author_name: row.get(2)?,
                    timestamp: parse_timestamp(&created_raw),
                })
            })
            .map_err(|e| Error::Database(format!("failed to load conversation: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            entries
                .push(row.map_err(|e| Error::Database(format!("failed to read entry row: {e}")))?);
        }
        Ok(entries)
    }

    /// Drop the conversation for one model, or for every model when `model`
    /// is `None`.
    pub fn clear_conversation(
        &self,
        guild_id: &str,
        user_id: &str,
        model: Option<&str>,
    ) -> Result<usize> {
        let deleted = match model {
            Some(model) => self
                .conn
                .execute(
                    "DELETE FROM conversations WHERE guild_id = ?1 AND user_id = ?2 AND model = ?3",
                    params![guild_id, user_id, model],
                )
                .map_err(|e| Error::Database(format!("failed to clear conversation: {e}")))?,
            None => self
                .conn
                .execute(
                    "DELETE FROM conversations WHERE guild_id = ?1 AND user_id = ?2",
                    params![guild_id, user_id],
                )
                .map_err(|e| Error::Database(format!("failed to clear conversations: {e}")))?,
        };
        Ok(deleted)
    }

    /// Remove the most recent user/assistant pair, used before a regenerate
    /// so the new response does not parrot the discarded one.
    pub fn remove_last_turn(&self, guild_id: &str, user_id: &str, model: &str) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM conversations WHERE rowid IN (
                    SELECT rowid FROM conversations
                    WHERE guild_id = ?1 AND user_id = ?2 AND model = ?3
                    ORDER BY rowid DESC LIMIT 2
                 )",
                params![guild_id, user_id, model],
            )
            .map_err(|e| Error::Database(format!("failed to remove last turn: {e}")))?;
        Ok(deleted)
    }

    // ---- guild settings ----------------------------------------------------

    pub fn guild_settings(&self, guild_id: &str) -> Result<Option<GuildSettingsRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT guild_id, enabled, model, model_locked FROM guild_settings WHERE guild_id = ?1")
            .map_err(|e| Error::Database(format!("failed to prepare settings query: {e}")))?;

        let row = stmt
            .query_row(params![guild_id], |row| {
                Ok(GuildSettingsRow {
                    guild_id: row.get(0)?,
                    enabled: row.get::<_, i64>(1)? != 0,
                    model: row.get(2)?,
                    model_locked: row.get::<_, i64>(3)? != 0,
                })
            })
            .optional()
            .map_err(|e| Error::Database(format!("failed to load guild settings: {e}")))?;
        Ok(row)
    }

    pub fn upsert_guild_settings(&self, settings: &GuildSettingsRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO guild_settings (guild_id, enabled, model, model_locked)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(guild_id) DO UPDATE SET
                   enabled = excluded.enabled,
                   model = excluded.model,
                   model_locked = excluded.model_locked",
                params![
                    settings.guild_id,
                    settings.enabled as i64,
                    settings.model,
                    settings.model_locked as i64,
                ],
            )
            .map_err(|e| Error::Database(format!("failed to upsert guild settings: {e}")))?;
        Ok(())
    }

    // ---- user model preference ---------------------------------------------

    pub fn user_model(&self, user_id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT model FROM user_models WHERE user_id = ?1")
            .map_err(|e| Error::Database(format!("failed to prepare model query: {e}")))?;

        let model = stmt
            .query_row(params![user_id], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Database(format!("failed to load user model: {e}")))?;
        Ok(model)
    }

    pub fn set_user_model(&self, user_id: &str, model: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_models (user_id, model) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET model = excluded.model",
                params![user_id, model],
            )
            .map_err(|e| Error::Database(format!("failed to set user model: {e}")))?;
        Ok(())
    }

    // ---- bypasses and blacklist --------------------------------------------

    pub fn is_bypassed(&self, user_id: &str) -> Result<bool> {
        self.exists("SELECT 1 FROM limit_bypasses WHERE user_id = ?1", user_id)
    }

    pub fn add_bypass(&self, user_id: &str, added_by: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO limit_bypasses (user_id, added_by, added_at)
                 VALUES (?1, ?2, ?3)",
                params![user_id, added_by, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to add bypass: {e}")))?;
        Ok(())
    }

    pub fn remove_bypass(&self, user_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM limit_bypasses WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(|e| Error::Database(format!("failed to remove bypass: {e}")))?;
        Ok(rows > 0)
    }

    pub fn is_blacklisted(&self, user_id: &str) -> Result<bool> {
        self.exists("SELECT 1 FROM global_blacklist WHERE user_id = ?1", user_id)
    }

    pub fn add_blacklist(&self, user_id: &str, reason: &str, added_by: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO global_blacklist (user_id, reason, added_by, added_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, reason, added_by, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to add blacklist entry: {e}")))?;
        Ok(())
    }

    pub fn remove_blacklist(&self, user_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM global_blacklist WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(|e| Error::Database(format!("failed to remove blacklist entry: {e}")))?;
        Ok(rows > 0)
    }

    fn exists(&self, sql: &str, user_id: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("failed to prepare lookup: {e}")))?;
        let found: Option<i64> = stmt
            .query_row(params![user_id], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Database(format!("lookup failed: {e}")))?;
        Ok(found.is_some())
    }

    // ---- limit overrides ---------------------------------------------------

    /// Operator-configured daily limit for a model, overriding the
    /// descriptor default when present.
    pub fn limit_override(&self, model: &str) -> Result<Option<u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT daily_limit FROM limit_overrides WHERE model = ?1")
            .map_err(|e| Error::Database(format!("failed to prepare override query: {e}")))?;

        let value: Option<i64> = stmt
            .query_row(params![model], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Database(format!("failed to load limit override: {e}")))?;
        Ok(value.map(|v| v.max(0) as u64))
    }

    pub fn set_limit_override(&self, model: &str, daily_limit: u64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO limit_overrides (model, daily_limit) VALUES (?1, ?2)
                 ON CONFLICT(model) DO UPDATE SET daily_limit = excluded.daily_limit",
                params![model, daily_limit as i64],
            )
            .map_err(|e| Error::Database(format!("failed to set limit override: {e}")))?;
        Ok(())
    }

    // ---- quotas ------------------------------------------------------------

    pub fn quota_row(&self, user_id: &str) -> Result<Option<QuotaRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, characters_used, images_used, reset_date
                 FROM user_quotas WHERE user_id = ?1",
            )
            .map_err(|e| Error::Database(format!("failed to prepare quota query: {e}")))?;

        let row = stmt
            .query_row(params![user_id], |row| {
                Ok(QuotaRow {
                    user_id: row.get(0)?,
                    characters_used: row.get::<_, i64>(1)?.max(0) as u64,
                    images_used: row.get::<_, i64>(2)?.max(0) as u64,
                    reset_date: row.get(3)?,
                })
            })
            .optional()
            .map_err(|e| Error::Database(format!("failed to load quota row: {e}")))?;
        Ok(row)
    }

    pub fn put_quota_row(&self, row: &QuotaRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_quotas (user_id, characters_used, images_used, reset_date)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                   characters_used = excluded.characters_used,
                   images_used = excluded.images_used,
                   reset_date = excluded.reset_date",
                params![
                    row.user_id,
                    row.characters_used as i64,
                    row.images_used as i64,
                    row.reset_date,
                ],
            )
            .map_err(|e| Error::Database(format!("failed to store quota row: {e}")))?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|e| {
            warn!("failed to parse timestamp '{value}': {e}, falling back to now");
            chrono::Utc::now()
        })
}
