use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Fixed key of the active user profile. There is no authentication; a single
/// anonymous profile is the whole user model.
pub const ACTIVE_PROFILE_ID: &str = "default_user_profile";

const DEFAULT_PROFILE_NAME: &str = "User";
const DEFAULT_PROFILE_AVATAR: &str =
    "https://abs.twimg.com/sticky/default_profile_images/default_profile_400x400.png";
const DEFAULT_PROFILE_PERSONA: &str = "An ordinary user with no particular persona.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub id: String,
    pub name: String,
    pub avatar_url: String,
    pub character_persona: String,
    pub user_persona: String,
    pub style_prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterDraft {
    pub name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub character_persona: String,
    #[serde(default)]
    pub user_persona: String,
    #[serde(default)]
    pub style_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub avatar_url: String,
    pub user_persona: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub user_persona: String,
}

/// Conversation metadata. The record is created lazily on first send, so a
/// conversation id handed to a client may have messages but no metadata row
/// yet; readers treat that as an empty new conversation, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub character_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub current_summary: Option<String>,
}

/// One row of the per-character conversation listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationListEntry {
    pub id: String,
    pub character_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Model,
}

impl MessageRole {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Model => "model",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => MessageRole::User,
            _ => MessageRole::Model,
        }
    }
}

/// A persisted (or synthetic) conversation message. Persisted messages always
/// carry a store-assigned timestamp; a model-role message with a missing or
/// zero timestamp is a synthetic greeting that exists only for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// Most defensive sentinel check: a model-role message with a missing
    /// timestamp or the zero epoch is a greeting that must never reach
    /// storage or the model. User messages are never synthetic.
    pub fn is_synthetic(&self) -> bool {
        if self.role != MessageRole::Model {
            return false;
        }
        match self.created_at {
            None => true,
            Some(ts) => ts.timestamp_millis() == 0,
        }
    }
}

pub struct CharacterDatabase {
    conn: Mutex<Connection>,
}

impl CharacterDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS characters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                avatar_url TEXT NOT NULL DEFAULT '',
                character_persona TEXT NOT NULL DEFAULT '',
                user_persona TEXT NOT NULL DEFAULT '',
                style_prompt TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_profiles (
                user_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                avatar_url TEXT NOT NULL DEFAULT '',
                user_persona TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                character_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                current_summary TEXT
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
                ON messages(conversation_id, created_at ASC);
            CREATE INDEX IF NOT EXISTS idx_conversations_character
                ON conversations(character_id);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Characters
    // ------------------------------------------------------------------

    pub fn create_character(&self, draft: &CharacterDraft) -> Result<CharacterRecord> {
        let name = draft.name.trim();
        if name.is_empty() {
            anyhow::bail!("character name cannot be empty");
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = format_ts(now);

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO characters (id, name, avatar_url, character_persona, user_persona, style_prompt, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                name,
                draft.avatar_url,
                draft.character_persona,
                draft.user_persona,
                draft.style_prompt,
                now_str.clone(),
                now_str,
            ],
        )?;

        Ok(CharacterRecord {
            id,
            name: name.to_string(),
            avatar_url: draft.avatar_url.clone(),
            character_persona: draft.character_persona.clone(),
            user_persona: draft.user_persona.clone(),
            style_prompt: draft.style_prompt.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_character(
        &self,
        character_id: &str,
        draft: &CharacterDraft,
    ) -> Result<Option<CharacterRecord>> {
        let name = draft.name.trim();
        if name.is_empty() {
            anyhow::bail!("character name cannot be empty");
        }
        let now_str = format_ts(Utc::now());
        {
            let conn = self.lock_conn()?;
            let updated = conn.execute(
                "UPDATE characters
                 SET name = ?2, avatar_url = ?3, character_persona = ?4,
                     user_persona = ?5, style_prompt = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    character_id,
                    name,
                    draft.avatar_url,
                    draft.character_persona,
                    draft.user_persona,
                    draft.style_prompt,
                    now_str,
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_character(character_id)
    }

    pub fn get_character(&self, character_id: &str) -> Result<Option<CharacterRecord>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, name, avatar_url, character_persona, user_persona, style_prompt, created_at, updated_at
             FROM characters WHERE id = ?1",
            [character_id],
            row_to_character,
        )
        .optional()
        .context("Failed to read character")
    }

    pub fn list_characters(&self) -> Result<Vec<CharacterRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, avatar_url, character_persona, user_persona, style_prompt, created_at, updated_at
             FROM characters ORDER BY created_at DESC",
        )?;
        let characters = stmt
            .query_map([], row_to_character)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(characters)
    }

    // ------------------------------------------------------------------
    // User profiles
    // ------------------------------------------------------------------

    /// Fetch the active profile, falling back to the built-in anonymous one
    /// when nothing has been saved yet.
    pub fn get_active_profile(&self) -> Result<UserProfile> {
        let conn = self.lock_conn()?;
        let profile = conn
            .query_row(
                "SELECT user_id, name, avatar_url, user_persona, updated_at
                 FROM user_profiles WHERE user_id = ?1",
                [ACTIVE_PROFILE_ID],
                row_to_profile,
            )
            .optional()?;

        Ok(profile.unwrap_or_else(|| UserProfile {
            user_id: ACTIVE_PROFILE_ID.to_string(),
            name: DEFAULT_PROFILE_NAME.to_string(),
            avatar_url: DEFAULT_PROFILE_AVATAR.to_string(),
            user_persona: DEFAULT_PROFILE_PERSONA.to_string(),
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }))
    }

    pub fn save_active_profile(&self, draft: &ProfileDraft) -> Result<UserProfile> {
        self.save_profile_row(ACTIVE_PROFILE_ID, draft)
    }

    /// Save a named variant into the profile library under its own identity.
    pub fn save_profile_variant(&self, draft: &ProfileDraft) -> Result<UserProfile> {
        let id = uuid::Uuid::new_v4().to_string();
        self.save_profile_row(&id, draft)
    }

    fn save_profile_row(&self, user_id: &str, draft: &ProfileDraft) -> Result<UserProfile> {
        let name = draft.name.trim();
        if name.is_empty() {
            anyhow::bail!("profile name cannot be empty");
        }
        let now = Utc::now();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO user_profiles (user_id, name, avatar_url, user_persona, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                 name = excluded.name,
                 avatar_url = excluded.avatar_url,
                 user_persona = excluded.user_persona,
                 updated_at = excluded.updated_at",
            params![user_id, name, draft.avatar_url, draft.user_persona, format_ts(now)],
        )?;
        Ok(UserProfile {
            user_id: user_id.to_string(),
            name: name.to_string(),
            avatar_url: draft.avatar_url.clone(),
            user_persona: draft.user_persona.clone(),
            updated_at: now,
        })
    }

    pub fn list_profile_variants(&self) -> Result<Vec<UserProfile>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, name, avatar_url, user_persona, updated_at
             FROM user_profiles WHERE user_id != ?1
             ORDER BY updated_at DESC",
        )?;
        let profiles = stmt
            .query_map([ACTIVE_PROFILE_ID], row_to_profile)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Idempotently create the conversation metadata record. Re-running this
    /// never overwrites an existing title or creation timestamp.
    pub fn ensure_conversation(&self, conversation_id: &str, character_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, character_id, title, created_at, current_summary)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![
                conversation_id,
                character_id,
                "New conversation",
                format_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Fetch metadata for one conversation. `None` means the record has not
    /// been lazily created yet, which callers must treat as an empty new
    /// conversation.
    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, character_id, title, created_at, current_summary
             FROM conversations WHERE id = ?1",
            [conversation_id],
            row_to_conversation,
        )
        .optional()
        .context("Failed to read conversation")
    }

    /// List a character's conversations, newest activity first, with a short
    /// preview of the latest message.
    pub fn list_conversations_for_character(
        &self,
        character_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationListEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT
                   c.id,
                   c.character_id,
                   c.title,
                   c.created_at,
                   COUNT(m.id) AS message_count,
                   (SELECT content FROM messages
                    WHERE conversation_id = c.id
                    ORDER BY created_at DESC LIMIT 1) AS last_content,
                   MAX(m.created_at) AS last_message_at
               FROM conversations c
               LEFT JOIN messages m ON m.conversation_id = c.id
               WHERE c.character_id = ?1
               GROUP BY c.id
               ORDER BY COALESCE(MAX(m.created_at), c.created_at) DESC
               LIMIT ?2"#,
        )?;

        let entries = stmt
            .query_map(params![character_id, limit], |row| {
                let created_at_str: String = row.get(3)?;
                let message_count = row.get::<_, i64>(4)? as usize;
                let last_content: Option<String> = row.get(5)?;
                let last_message_at_str: Option<String> = row.get(6)?;

                Ok(ConversationListEntry {
                    id: row.get(0)?,
                    character_id: row.get(1)?,
                    title: row.get(2)?,
                    created_at: parse_ts(&created_at_str, 3)?,
                    message_count,
                    last_message_preview: last_content.map(|c| preview(&c, 50)),
                    last_message_at: match last_message_at_str {
                        Some(v) => Some(parse_ts(&v, 6)?),
                        None => None,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Update only the title, leaving everything else alone.
    pub fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<bool> {
        let title = title.trim();
        if title.is_empty() {
            anyhow::bail!("conversation title cannot be empty");
        }
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE conversations SET title = ?2 WHERE id = ?1",
            params![conversation_id, title],
        )?;
        Ok(updated > 0)
    }

    /// Merge-style upsert of the rolling summary. Creates the metadata record
    /// if needed, then touches only `current_summary`; title and created_at
    /// are preserved. An empty summary clears the field.
    pub fn set_conversation_summary(
        &self,
        conversation_id: &str,
        character_id: &str,
        summary: &str,
    ) -> Result<()> {
        self.ensure_conversation(conversation_id, character_id)?;
        let summary = summary.trim();
        let stored: Option<&str> = if summary.is_empty() { None } else { Some(summary) };
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE conversations SET current_summary = ?2 WHERE id = ?1",
            params![conversation_id, stored],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append one message with a store-assigned timestamp. Timestamps are
    /// monotonic per conversation even when the wall clock stalls, so append
    /// order and timestamp order always agree.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;

        let last: Option<String> = conn
            .query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let mut created_at = Utc::now();
        if let Some(last_str) = last {
            if let Ok(last_ts) = last_str.parse::<DateTime<Utc>>() {
                if last_ts >= created_at {
                    created_at = last_ts + Duration::milliseconds(1);
                }
            }
        }

        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                conversation_id,
                role.as_db_str(),
                content,
                format_ts(created_at),
            ],
        )?;

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Some(created_at),
        })
    }

    /// Full ordered message log for a conversation, oldest first.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at ASC",
        )?;
        let messages = stmt
            .query_map([conversation_id], |row| {
                let role_raw: String = row.get(2)?;
                let created_at_str: String = row.get(4)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: MessageRole::from_db(&role_raw),
                    content: row.get(3)?,
                    created_at: Some(parse_ts(&created_at_str, 4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC timestamps sort lexicographically, which the message
    // ordering queries rely on.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, column: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let truncated: String = content.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn row_to_character(row: &rusqlite::Row<'_>) -> Result<CharacterRecord, rusqlite::Error> {
    let created_at_str: String = row.get(6)?;
    let updated_at_str: String = row.get(7)?;
    Ok(CharacterRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        avatar_url: row.get(2)?,
        character_persona: row.get(3)?,
        user_persona: row.get(4)?,
        style_prompt: row.get(5)?,
        created_at: parse_ts(&created_at_str, 6)?,
        updated_at: parse_ts(&updated_at_str, 7)?,
    })
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> Result<UserProfile, rusqlite::Error> {
    let updated_at_str: String = row.get(4)?;
    Ok(UserProfile {
        user_id: row.get(0)?,
        name: row.get(1)?,
        avatar_url: row.get(2)?,
        user_persona: row.get(3)?,
        updated_at: parse_ts(&updated_at_str, 4)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, rusqlite::Error> {
    let created_at_str: String = row.get(3)?;
    Ok(Conversation {
        id: row.get(0)?,
        character_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_ts(&created_at_str, 3)?,
        current_summary: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_db(dir: &tempfile::TempDir) -> CharacterDatabase {
        CharacterDatabase::new(dir.path().join("test.db")).unwrap()
    }

    fn draft(name: &str) -> CharacterDraft {
        CharacterDraft {
            name: name.to_string(),
            avatar_url: String::new(),
            character_persona: "A stoic knight.".to_string(),
            user_persona: String::new(),
            style_prompt: String::new(),
        }
    }

    #[test]
    fn character_roundtrip_and_update() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let created = db.create_character(&draft("Aldric")).unwrap();
        let fetched = db.get_character(&created.id).unwrap().unwrap();
        assert_eq!(fetched.name, "Aldric");
        assert_eq!(fetched.character_persona, "A stoic knight.");

        let mut edit = draft("Aldric the Bold");
        edit.style_prompt = "Speak formally.".to_string();
        let updated = db.update_character(&created.id, &edit).unwrap().unwrap();
        assert_eq!(updated.name, "Aldric the Bold");
        assert_eq!(updated.style_prompt, "Speak formally.");
        assert_eq!(updated.created_at, created.created_at);

        assert!(db.update_character("missing", &edit).unwrap().is_none());
    }

    #[test]
    fn active_profile_defaults_until_saved() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let profile = db.get_active_profile().unwrap();
        assert_eq!(profile.user_id, ACTIVE_PROFILE_ID);
        assert_eq!(profile.name, "User");

        db.save_active_profile(&ProfileDraft {
            name: "Mina".to_string(),
            avatar_url: String::new(),
            user_persona: "A night-shift radio host.".to_string(),
        })
        .unwrap();

        let profile = db.get_active_profile().unwrap();
        assert_eq!(profile.name, "Mina");
        assert_eq!(profile.user_persona, "A night-shift radio host.");
    }

    #[test]
    fn profile_library_excludes_active_profile() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.save_active_profile(&ProfileDraft {
            name: "Mina".to_string(),
            avatar_url: String::new(),
            user_persona: String::new(),
        })
        .unwrap();
        let variant = db
            .save_profile_variant(&ProfileDraft {
                name: "Weekend Mina".to_string(),
                avatar_url: String::new(),
                user_persona: "Off duty.".to_string(),
            })
            .unwrap();

        let library = db.list_profile_variants().unwrap();
        assert_eq!(library.len(), 1);
        assert_eq!(library[0].user_id, variant.user_id);
        assert_ne!(library[0].user_id, ACTIVE_PROFILE_ID);
    }

    #[test]
    fn ensure_conversation_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.ensure_conversation("conv-1", "char-1").unwrap();
        let first = db.get_conversation("conv-1").unwrap().unwrap();

        db.rename_conversation("conv-1", "First meeting").unwrap();
        db.ensure_conversation("conv-1", "char-1").unwrap();

        let second = db.get_conversation("conv-1").unwrap().unwrap();
        assert_eq!(second.title, "First meeting");
        assert_eq!(second.created_at, first.created_at);

        let listed = db.list_conversations_for_character("char-1", 10).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn absent_metadata_reads_as_none_while_messages_exist() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.append_message("conv-orphan", MessageRole::User, "hello?")
            .unwrap();
        assert!(db.get_conversation("conv-orphan").unwrap().is_none());
        assert_eq!(db.list_messages("conv-orphan").unwrap().len(), 1);
    }

    #[test]
    fn message_timestamps_are_monotonic_and_ordered() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        for i in 0..10 {
            db.append_message("conv-1", MessageRole::User, &format!("msg {}", i))
                .unwrap();
        }
        let messages = db.list_messages("conv-1").unwrap();
        assert_eq!(messages.len(), 10);
        for pair in messages.windows(2) {
            assert!(pair[0].created_at.unwrap() < pair[1].created_at.unwrap());
            assert!(!pair[0].is_synthetic());
        }
        assert_eq!(messages[0].content, "msg 0");
        assert_eq!(messages[9].content, "msg 9");
    }

    #[test]
    fn synthetic_sentinel_only_matches_model_messages() {
        let base = StoredMessage {
            id: "m-1".to_string(),
            conversation_id: "conv-1".to_string(),
            role: MessageRole::Model,
            content: "welcome!".to_string(),
            created_at: None,
        };
        assert!(base.is_synthetic());

        let zero_epoch = StoredMessage {
            created_at: Some(DateTime::<Utc>::UNIX_EPOCH),
            ..base.clone()
        };
        assert!(zero_epoch.is_synthetic());

        // A user message is never synthetic, whatever its timestamp says.
        let user_no_ts = StoredMessage {
            role: MessageRole::User,
            ..base.clone()
        };
        assert!(!user_no_ts.is_synthetic());
        let user_zero_epoch = StoredMessage {
            role: MessageRole::User,
            created_at: Some(DateTime::<Utc>::UNIX_EPOCH),
            ..base
        };
        assert!(!user_zero_epoch.is_synthetic());
    }

    #[test]
    fn summary_upsert_preserves_title_and_created_at() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.ensure_conversation("conv-1", "char-1").unwrap();
        db.rename_conversation("conv-1", "The ballad").unwrap();
        let before = db.get_conversation("conv-1").unwrap().unwrap();

        db.set_conversation_summary("conv-1", "char-1", "They argued about pie.")
            .unwrap();
        let after = db.get_conversation("conv-1").unwrap().unwrap();
        assert_eq!(after.title, "The ballad");
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.current_summary.as_deref(), Some("They argued about pie."));

        // Clearing stores NULL, not an empty string.
        db.set_conversation_summary("conv-1", "char-1", "  ").unwrap();
        let cleared = db.get_conversation("conv-1").unwrap().unwrap();
        assert!(cleared.current_summary.is_none());
    }

    #[test]
    fn summary_upsert_creates_missing_metadata() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.set_conversation_summary("conv-new", "char-1", "Short.")
            .unwrap();
        let conversation = db.get_conversation("conv-new").unwrap().unwrap();
        assert_eq!(conversation.character_id, "char-1");
        assert_eq!(conversation.current_summary.as_deref(), Some("Short."));
    }

    #[test]
    fn conversation_listing_includes_preview_and_counts() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        db.ensure_conversation("conv-1", "char-1").unwrap();
        db.append_message("conv-1", MessageRole::User, "hi").unwrap();
        let long = "x".repeat(80);
        db.append_message("conv-1", MessageRole::Model, &long).unwrap();

        let listed = db.list_conversations_for_character("char-1", 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message_count, 2);
        let preview = listed[0].last_message_preview.as_deref().unwrap();
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 53);
        assert!(listed[0].last_message_at.is_some());
    }
}
