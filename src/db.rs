//! SQLite persistence: characters, conversation messages, presets,
//! playback log, wish-session archive, and singleton token/config rows.
//!
//! Migrations are forward-only and idempotent: attempt the column add and
//! swallow the already-exists error.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::models::{
    AiSettings, Character, CharacterCreate, CharacterUpdate, ChatContextPolicy, MemoryPolicy,
    PlaybackLogEntry, TextPreset, TextStyle,
};
use crate::tts::TtsProvider;

/// Database error classification.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Duplicate,
    #[error("updated_at mismatch; refresh and retry")]
    Conflict,
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// SQLite-backed store shared across the server.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DbError::Other(e.to_string()))?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;
        Self::run_migrations(&conn);
        info!("Database ready at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Self::run_migrations(&conn);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), DbError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS character (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                color TEXT,
                icon TEXT,
                text_style TEXT NOT NULL DEFAULT '{}',
                tts_provider TEXT NOT NULL DEFAULT 'elevenlabs',
                tts_settings TEXT,
                ai_settings TEXT,
                chat_context TEXT NOT NULL DEFAULT '{}',
                memory_enabled INTEGER NOT NULL DEFAULT 0,
                persist_memory INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversation_message (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                character TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                interrupted INTEGER NOT NULL DEFAULT 0,
                generated_text TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_message_character
                ON conversation_message(character, created_at);

            CREATE TABLE IF NOT EXISTS text_preset (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                text TEXT NOT NULL,
                style TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS playback_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                character TEXT NOT NULL,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS wish_session (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_login TEXT NOT NULL,
                user_display_name TEXT NOT NULL,
                wish_text TEXT NOT NULL,
                outcome TEXT NOT NULL,
                followup_count INTEGER NOT NULL DEFAULT 0,
                conversation TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_wish_user
                ON wish_session(user_id, created_at);

            CREATE TABLE IF NOT EXISTS twitch_token (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                access_token TEXT NOT NULL,
                broadcaster_user_id TEXT,
                user_id TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS wish_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                config TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Forward-only column adds for databases created by older builds.
    fn run_migrations(conn: &Connection) {
        let migrations = [
            "ALTER TABLE character ADD COLUMN persist_memory INTEGER DEFAULT 0",
            "ALTER TABLE character ADD COLUMN tts_provider TEXT DEFAULT 'elevenlabs'",
            "ALTER TABLE character ADD COLUMN tts_settings TEXT",
            "ALTER TABLE conversation_message ADD COLUMN generated_text TEXT",
        ];
        for migration in migrations {
            // Column already exists on fresh databases
            let _ = conn.execute(migration, []);
        }
    }

    // ─── Characters ──────────────────────────────────────────────

    pub async fn create_character(&self, create: CharacterCreate) -> Result<Character, DbError> {
        let conn = self.conn.lock().await;

        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM character WHERE name = ?1",
                params![create.name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(DbError::Duplicate);
        }

        let now = Utc::now();
        conn.execute(
            r#"INSERT INTO character
               (name, description, color, icon, text_style, tts_provider, tts_settings,
                ai_settings, chat_context, memory_enabled, persist_memory, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            params![
                create.name,
                create.description,
                create.color,
                create.icon,
                serde_json::to_string(&create.text_style)?,
                provider_str(create.tts_provider),
                serde_json::to_string(&create.tts_settings)?,
                create
                    .ai
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&create.chat_context)?,
                create.memory.enabled as i64,
                create.memory.persist as i64,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(Character {
            id: Some(id),
            name: create.name,
            description: create.description,
            color: create.color,
            icon: create.icon,
            text_style: create.text_style,
            tts_provider: create.tts_provider,
            tts_settings: create.tts_settings,
            ai: create.ai,
            chat_context: create.chat_context,
            memory: create.memory,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn list_characters(&self) -> Result<Vec<Character>, DbError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM character ORDER BY name",
            CHARACTER_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_character)?;
        let mut characters = Vec::new();
        for row in rows {
            characters.push(row?);
        }
        Ok(characters)
    }

    pub async fn get_character(&self, name: &str) -> Result<Option<Character>, DbError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM character WHERE name = ?1",
            CHARACTER_COLUMNS
        ))?;
        Ok(stmt
            .query_row(params![name], row_to_character)
            .optional()?)
    }

    /// Apply a partial update with optimistic concurrency. A mismatched
    /// `expected_updated_at` is a conflict; an update that changes nothing
    /// leaves the row (and its token) untouched.
    pub async fn update_character(
        &self,
        name: &str,
        update: CharacterUpdate,
    ) -> Result<Character, DbError> {
        let mut current = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM character WHERE name = ?1",
                CHARACTER_COLUMNS
            ))?;
            stmt.query_row(params![name], row_to_character)
                .optional()?
                .ok_or(DbError::NotFound)?
        };

        if let Some(expected) = update.expected_updated_at {
            if expected != current.updated_at {
                return Err(DbError::Conflict);
            }
        }

        let before = serde_json::to_value(&current)?;
        if let Some(v) = update.description {
            current.description = v;
        }
        if let Some(v) = update.color {
            current.color = v;
        }
        if let Some(v) = update.icon {
            current.icon = v;
        }
        if let Some(v) = update.text_style {
            current.text_style = v;
        }
        if let Some(v) = update.tts_provider {
            current.tts_provider = v;
        }
        if let Some(v) = update.tts_settings {
            current.tts_settings = v;
        }
        if let Some(v) = update.ai {
            current.ai = v;
        }
        if let Some(v) = update.chat_context {
            current.chat_context = v;
        }
        if let Some(v) = update.memory {
            current.memory = v;
        }

        if serde_json::to_value(&current)? == before {
            return Ok(current);
        }

        current.updated_at = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"UPDATE character SET
               description = ?1, color = ?2, icon = ?3, text_style = ?4,
               tts_provider = ?5, tts_settings = ?6, ai_settings = ?7,
               chat_context = ?8, memory_enabled = ?9, persist_memory = ?10,
               updated_at = ?11
               WHERE name = ?12"#,
            params![
                current.description,
                current.color,
                current.icon,
                serde_json::to_string(&current.text_style)?,
                provider_str(current.tts_provider),
                serde_json::to_string(&current.tts_settings)?,
                current.ai.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&current.chat_context)?,
                current.memory.enabled as i64,
                current.memory.persist as i64,
                current.updated_at.to_rfc3339(),
                name,
            ],
        )?;
        Ok(current)
    }

    pub async fn delete_character(&self, name: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM character WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // ─── Conversation messages ───────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_message(
        &self,
        character: &str,
        role: &str,
        content: &str,
        interrupted: bool,
        generated_text: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO conversation_message
               (character, role, content, interrupted, generated_text, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                character,
                role,
                content,
                interrupted as i64,
                generated_text,
                created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn update_message_content(&self, id: i64, content: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE conversation_message SET content = ?1 WHERE id = ?2",
            params![content, id],
        )?;
        Ok(())
    }

    pub async fn delete_messages(&self, character: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM conversation_message WHERE character = ?1",
            params![character],
        )?;
        Ok(())
    }

    /// Load all messages for characters whose memory persists, grouped by
    /// character, in created-at order. Used at startup.
    pub async fn load_persistent_messages(
        &self,
    ) -> Result<Vec<(String, i64, String, String, bool, Option<String>, DateTime<Utc>)>, DbError>
    {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT m.character, m.id, m.role, m.content, m.interrupted, m.generated_text, m.created_at
               FROM conversation_message m
               JOIN character c ON c.name = m.character
               WHERE c.persist_memory = 1
               ORDER BY m.character, m.created_at, m.id"#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)? != 0,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (character, id, role, content, interrupted, generated, created) = row?;
            out.push((
                character,
                id,
                role,
                content,
                interrupted,
                generated,
                parse_timestamp(&created),
            ));
        }
        Ok(out)
    }

    // ─── Presets ─────────────────────────────────────────────────

    pub async fn create_preset(
        &self,
        name: &str,
        text: &str,
        style: Option<&str>,
    ) -> Result<TextPreset, DbError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO text_preset (name, text, style, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, text, style, now.to_rfc3339()],
        )?;
        Ok(TextPreset {
            id: Some(conn.last_insert_rowid()),
            name: name.to_string(),
            text: text.to_string(),
            style: style.map(str::to_string),
            created_at: now,
        })
    }

    pub async fn list_presets(&self) -> Result<Vec<TextPreset>, DbError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, text, style, created_at FROM text_preset ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TextPreset {
                id: Some(row.get(0)?),
                name: row.get(1)?,
                text: row.get(2)?,
                style: row.get(3)?,
                created_at: parse_timestamp(&row.get::<_, String>(4)?),
            })
        })?;
        let mut presets = Vec::new();
        for row in rows {
            presets.push(row?);
        }
        Ok(presets)
    }

    pub async fn delete_preset(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM text_preset WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ─── Playback log ────────────────────────────────────────────

    pub async fn log_playback(
        &self,
        character: &str,
        content: &str,
        content_type: &str,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO playback_log (character, content, content_type, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![character, content, content_type, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn recent_playback(&self, limit: u32) -> Result<Vec<PlaybackLogEntry>, DbError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, character, content, content_type, timestamp FROM playback_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(PlaybackLogEntry {
                id: row.get(0)?,
                character: row.get(1)?,
                content: row.get(2)?,
                content_type: row.get(3)?,
                timestamp: parse_timestamp(&row.get::<_, String>(4)?),
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // ─── Wish-session archive ────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn archive_wish_session(
        &self,
        session_id: &str,
        user_id: &str,
        user_login: &str,
        user_display_name: &str,
        wish_text: &str,
        outcome: &str,
        followup_count: u32,
        conversation: &Value,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO wish_session
               (session_id, user_id, user_login, user_display_name, wish_text,
                outcome, followup_count, conversation, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                session_id,
                user_id,
                user_login,
                user_display_name,
                wish_text,
                outcome,
                followup_count,
                serde_json::to_string(conversation)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent prior sessions by a user: `(wish_text, outcome)` pairs.
    pub async fn recent_wishes_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<(String, String)>, DbError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wish_text, outcome FROM wish_session WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut wishes = Vec::new();
        for row in rows {
            wishes.push(row?);
        }
        Ok(wishes)
    }

    // ─── Singletons ──────────────────────────────────────────────

    pub async fn set_twitch_token(
        &self,
        access_token: &str,
        broadcaster_user_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO twitch_token (id, access_token, broadcaster_user_id, user_id, updated_at)
               VALUES (1, ?1, ?2, ?3, ?4)
               ON CONFLICT(id) DO UPDATE SET
                 access_token = excluded.access_token,
                 broadcaster_user_id = excluded.broadcaster_user_id,
                 user_id = excluded.user_id,
                 updated_at = excluded.updated_at"#,
            params![
                access_token,
                broadcaster_user_id,
                user_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub async fn get_twitch_token(
        &self,
    ) -> Result<Option<(String, Option<String>, Option<String>)>, DbError> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT access_token, broadcaster_user_id, user_id FROM twitch_token WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?)
    }

    pub async fn set_wish_config(&self, config: &Value) -> Result<(), DbError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO wish_config (id, config, updated_at) VALUES (1, ?1, ?2)
               ON CONFLICT(id) DO UPDATE SET
                 config = excluded.config, updated_at = excluded.updated_at"#,
            params![serde_json::to_string(config)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn get_wish_config(&self) -> Result<Option<Value>, DbError> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row("SELECT config FROM wish_config WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }
}

const CHARACTER_COLUMNS: &str = "id, name, description, color, icon, text_style, tts_provider, \
     tts_settings, ai_settings, chat_context, memory_enabled, persist_memory, created_at, updated_at";

fn provider_str(provider: TtsProvider) -> &'static str {
    provider.as_str()
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_character(row: &rusqlite::Row<'_>) -> rusqlite::Result<Character> {
    let text_style: String = row.get(5)?;
    let provider: String = row.get(6)?;
    let tts_settings: Option<String> = row.get(7)?;
    let ai_settings: Option<String> = row.get(8)?;
    let chat_context: String = row.get(9)?;

    let tts_provider = match provider.as_str() {
        "cartesia" => TtsProvider::Cartesia,
        _ => TtsProvider::ElevenLabs,
    };

    Ok(Character {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        color: row.get(3)?,
        icon: row.get(4)?,
        text_style: serde_json::from_str::<TextStyle>(&text_style).unwrap_or_default(),
        tts_provider,
        tts_settings: tts_settings
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null),
        ai: ai_settings.and_then(|s| serde_json::from_str::<AiSettings>(&s).ok()),
        chat_context: serde_json::from_str::<ChatContextPolicy>(&chat_context).unwrap_or_default(),
        memory: MemoryPolicy {
            enabled: row.get::<_, i64>(10)? != 0,
            persist: row.get::<_, i64>(11)? != 0,
        },
        created_at: parse_timestamp(&row.get::<_, String>(12)?),
        updated_at: parse_timestamp(&row.get::<_, String>(13)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_create(name: &str) -> CharacterCreate {
        CharacterCreate {
            name: name.to_string(),
            description: Some("test character".into()),
            color: None,
            icon: None,
            text_style: TextStyle::default(),
            tts_provider: TtsProvider::ElevenLabs,
            tts_settings: serde_json::json!({"voice_id": "v1"}),
            ai: None,
            chat_context: ChatContextPolicy::default(),
            memory: MemoryPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_character_create_get_roundtrip() {
        let db = Database::open_in_memory().await.unwrap();
        let created = db.create_character(sample_create("alice")).await.unwrap();
        let fetched = db.get_character("alice").await.unwrap().unwrap();

        assert_eq!(fetched.name, created.name);
        assert_eq!(fetched.description, created.description);
        assert_eq!(fetched.tts_provider, TtsProvider::ElevenLabs);
        assert_eq!(fetched.tts_settings["voice_id"], "v1");
        assert_eq!(fetched.text_style, created.text_style);
    }

    #[tokio::test]
    async fn test_duplicate_character_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_character(sample_create("alice")).await.unwrap();
        assert!(matches!(
            db.create_character(sample_create("alice")).await,
            Err(DbError::Duplicate)
        ));
    }

    #[tokio::test]
    async fn test_update_optimistic_concurrency() {
        let db = Database::open_in_memory().await.unwrap();
        let created = db.create_character(sample_create("alice")).await.unwrap();

        let update = CharacterUpdate {
            expected_updated_at: Some(created.updated_at),
            description: Some(Some("updated".into())),
            ..Default::default()
        };
        let updated = db.update_character("alice", update).await.unwrap();
        assert_eq!(updated.description.as_deref(), Some("updated"));
        assert!(updated.updated_at > created.updated_at);

        // Stale token now conflicts
        let stale = CharacterUpdate {
            expected_updated_at: Some(created.updated_at),
            description: Some(Some("again".into())),
            ..Default::default()
        };
        assert!(matches!(
            db.update_character("alice", stale).await,
            Err(DbError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_update_same_values_is_noop() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_character(sample_create("alice")).await.unwrap();

        let update = CharacterUpdate {
            description: Some(Some("same".into())),
            ..Default::default()
        };
        let first = db.update_character("alice", update.clone()).await.unwrap();
        let second = db.update_character("alice", update).await.unwrap();
        // The second identical update does not bump the concurrency token
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_delete_character() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_character(sample_create("alice")).await.unwrap();
        db.delete_character("alice").await.unwrap();
        assert!(db.get_character("alice").await.unwrap().is_none());
        assert!(matches!(
            db.delete_character("alice").await,
            Err(DbError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_messages_roundtrip() {
        let db = Database::open_in_memory().await.unwrap();
        let mut create = sample_create("bob");
        create.memory = MemoryPolicy {
            enabled: true,
            persist: true,
        };
        db.create_character(create).await.unwrap();

        let id = db
            .insert_message("bob", "user", "hello", false, None, Utc::now())
            .await
            .unwrap();
        db.insert_message("bob", "assistant", "One two", true, Some("One two three four"), Utc::now())
            .await
            .unwrap();

        let loaded = db.load_persistent_messages().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, "bob");
        assert_eq!(loaded[0].2, "user");
        assert!(loaded[1].4); // interrupted
        assert_eq!(loaded[1].5.as_deref(), Some("One two three four"));

        db.update_message_content(id, "rewritten").await.unwrap();
        let loaded = db.load_persistent_messages().await.unwrap();
        assert_eq!(loaded[0].3, "rewritten");

        db.delete_messages("bob").await.unwrap();
        assert!(db.load_persistent_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wish_archive_and_recent() {
        let db = Database::open_in_memory().await.unwrap();
        for (i, outcome) in ["grant", "deny", "timeout", "grant"].iter().enumerate() {
            db.archive_wish_session(
                &format!("s{}", i),
                "u1",
                "gina",
                "Gina",
                &format!("wish {}", i),
                outcome,
                0,
                &serde_json::json!([]),
            )
            .await
            .unwrap();
        }
        let recent = db.recent_wishes_for_user("u1", 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].0, "wish 3");
        assert_eq!(recent[0].1, "grant");
        assert!(db.recent_wishes_for_user("nobody", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_singletons() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.get_twitch_token().await.unwrap().is_none());
        db.set_twitch_token("tok", Some("123"), None).await.unwrap();
        db.set_twitch_token("tok2", Some("123"), Some("456"))
            .await
            .unwrap();
        let (token, broadcaster, user) = db.get_twitch_token().await.unwrap().unwrap();
        assert_eq!(token, "tok2");
        assert_eq!(broadcaster.as_deref(), Some("123"));
        assert_eq!(user.as_deref(), Some("456"));

        let config = serde_json::json!({"max_followups": 2});
        db.set_wish_config(&config).await.unwrap();
        assert_eq!(db.get_wish_config().await.unwrap().unwrap(), config);
    }

    #[tokio::test]
    async fn test_presets_and_playback_log() {
        let db = Database::open_in_memory().await.unwrap();
        let preset = db.create_preset("intro", "Welcome!", None).await.unwrap();
        assert_eq!(db.list_presets().await.unwrap().len(), 1);
        assert!(db.delete_preset(preset.id.unwrap()).await.unwrap());
        assert!(!db.delete_preset(999).await.unwrap());

        db.log_playback("alice", "Hello", "stream").await.unwrap();
        db.log_playback("alice", "Later", "text").await.unwrap();
        let recent = db.recent_playback(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "Later");
    }
}
