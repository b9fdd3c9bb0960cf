use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use conduit_core::{
    ConduitError, Conversation, ConversationId, ConversationStatus, DecisionType, Episode, Message, Result,
};

use crate::traits::{ConversationStore, EpisodeLog};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        participants TEXT NOT NULL,
        status TEXT NOT NULL,
        turn_count INTEGER NOT NULL DEFAULT 0,
        context TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        last_activity TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        turn INTEGER NOT NULL,
        id TEXT NOT NULL UNIQUE,
        source TEXT NOT NULL,
        target TEXT NOT NULL,
        payload TEXT NOT NULL,
        in_reply_to TEXT,
        timestamp TEXT NOT NULL,
        PRIMARY KEY (conversation_id, turn)
    );

    CREATE TABLE IF NOT EXISTS episodes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        decision_type TEXT NOT NULL,
        state TEXT NOT NULL,
        action TEXT NOT NULL,
        reward REAL NOT NULL,
        next_state TEXT,
        terminal INTEGER NOT NULL,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(status);
    CREATE INDEX IF NOT EXISTS idx_episodes_type ON episodes(decision_type, seq);
";

/// SQLite-backed conversation store and episode log.
///
/// All statements run on the blocking pool; the connection is shared behind a
/// mutex so one handle can be cloned freely across tasks.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening conversation store");

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for concurrent readers; foreign keys guard messages → conversations.
        // FULL syncs the WAL on every commit, so an acknowledged turn survives power loss.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests and ephemeral hubs).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| ConduitError::Storage(format!("storage task failed: {e}")))?
    }
}

fn db_err(e: rusqlite::Error) -> ConduitError {
    ConduitError::Storage(e.to_string())
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ConduitError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ConduitError::Storage(format!("bad id '{raw}': {e}")))
}

fn upsert_conversation(conn: &Connection, c: &Conversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, participants, status, turn_count, context, created_at, last_activity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            participants = excluded.participants,
            status = excluded.status,
            turn_count = excluded.turn_count,
            context = excluded.context,
            last_activity = excluded.last_activity",
        rusqlite::params![
            c.id.to_string(),
            serde_json::to_string(&c.participants)?,
            c.status.as_str(),
            c.turn_counter as i64,
            serde_json::to_string(&c.context)?,
            ts(&c.created_at),
            ts(&c.last_activity),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Raw conversation row; decoded outside the rusqlite row closure.
struct ConversationRow {
    id: String,
    participants: String,
    status: String,
    turn_count: i64,
    context: String,
    created_at: String,
    last_activity: String,
}

impl ConversationRow {
    const COLUMNS: &'static str = "id, participants, status, turn_count, context, created_at, last_activity";

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            participants: row.get(1)?,
            status: row.get(2)?,
            turn_count: row.get(3)?,
            context: row.get(4)?,
            created_at: row.get(5)?,
            last_activity: row.get(6)?,
        })
    }

    fn decode(self) -> Result<Conversation> {
        let context: BTreeMap<String, serde_json::Value> = serde_json::from_str(&self.context)?;
        Ok(Conversation {
            id: parse_id(&self.id)?,
            participants: serde_json::from_str(&self.participants)?,
            status: self.status.parse().map_err(ConduitError::Storage)?,
            turn_counter: self.turn_count as u64,
            context,
            created_at: parse_ts(&self.created_at)?,
            last_activity: parse_ts(&self.last_activity)?,
        })
    }
}

struct MessageRow {
    conversation_id: String,
    turn: i64,
    id: String,
    source: String,
    target: String,
    payload: String,
    in_reply_to: Option<String>,
    timestamp: String,
}

impl MessageRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            turn: row.get(1)?,
            id: row.get(2)?,
            source: row.get(3)?,
            target: row.get(4)?,
            payload: row.get(5)?,
            in_reply_to: row.get(6)?,
            timestamp: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            source: self.source,
            target: self.target,
            turn: self.turn as u64,
            payload: serde_json::from_str(&self.payload)?,
            in_reply_to: self.in_reply_to.as_deref().map(parse_id).transpose()?,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}

struct EpisodeRow {
    id: String,
    decision_type: String,
    state: String,
    action: String,
    reward: f64,
    next_state: Option<String>,
    terminal: i64,
    recorded_at: String,
}

impl EpisodeRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            decision_type: row.get(1)?,
            state: row.get(2)?,
            action: row.get(3)?,
            reward: row.get(4)?,
            next_state: row.get(5)?,
            terminal: row.get(6)?,
            recorded_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Episode> {
        Ok(Episode {
            id: parse_id(&self.id)?,
            decision_type: self.decision_type.parse().map_err(ConduitError::Storage)?,
            state: serde_json::from_str(&self.state)?,
            action: serde_json::from_str(&self.action)?,
            reward: self.reward,
            next_state: self.next_state.as_deref().map(serde_json::from_str).transpose()?,
            terminal: self.terminal != 0,
            recorded_at: parse_ts(&self.recorded_at)?,
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.blocking(move |conn| upsert_conversation(conn, &conversation)).await
    }

    async fn append_message(&self, conversation: &Conversation, message: &Message) -> Result<()> {
        let conversation = conversation.clone();
        let message = message.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            upsert_conversation(&tx, &conversation)?;
            let inserted = tx.execute(
                "INSERT INTO messages (conversation_id, turn, id, source, target, payload, in_reply_to, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message.conversation_id.to_string(),
                    message.turn as i64,
                    message.id.to_string(),
                    message.source,
                    message.target,
                    serde_json::to_string(&message.payload)?,
                    message.in_reply_to.map(|id| id.to_string()),
                    ts(&message.timestamp),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    // Dropping `tx` rolls back the conversation update.
                    return Err(ConduitError::Storage(format!(
                        "turn {} already stored for conversation {}",
                        message.turn, message.conversation_id
                    )));
                }
                Err(e) => return Err(db_err(e)),
            }
            tx.commit().map_err(db_err)?;
            debug!(conversation_id = %message.conversation_id, turn = message.turn, "turn persisted");
            Ok(())
        })
        .await
    }

    async fn load_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM conversations WHERE id = ?1", ConversationRow::COLUMNS),
                    rusqlite::params![id.to_string()],
                    ConversationRow::read,
                )
                .optional()
                .map_err(db_err)?;
            row.map(ConversationRow::decode).transpose()
        })
        .await
    }

    async fn load_messages(&self, id: ConversationId) -> Result<Vec<Message>> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT conversation_id, turn, id, source, target, payload, in_reply_to, timestamp
                     FROM messages WHERE conversation_id = ?1 ORDER BY turn ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(rusqlite::params![id.to_string()], MessageRow::read)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(MessageRow::decode).collect()
        })
        .await
    }

    async fn list_conversations(&self, status: Option<ConversationStatus>) -> Result<Vec<Conversation>> {
        self.blocking(move |conn| {
            let rows = match status {
                Some(status) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {} FROM conversations WHERE status = ?1 ORDER BY last_activity DESC",
                            ConversationRow::COLUMNS
                        ))
                        .map_err(db_err)?;
                    let rows = stmt
                        .query_map(rusqlite::params![status.as_str()], ConversationRow::read)
                        .map_err(db_err)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(db_err)?;
                    rows
                }
                None => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {} FROM conversations ORDER BY last_activity DESC",
                            ConversationRow::COLUMNS
                        ))
                        .map_err(db_err)?;
                    let rows = stmt
                        .query_map([], ConversationRow::read)
                        .map_err(db_err)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(db_err)?;
                    rows
                }
            };
            rows.into_iter().map(ConversationRow::decode).collect()
        })
        .await
    }

    async fn count_by_status(&self) -> Result<Vec<(ConversationStatus, u64)>> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM conversations GROUP BY status ORDER BY status")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter()
                .map(|(status, count)| -> Result<(ConversationStatus, u64)> {
                    Ok((status.parse().map_err(ConduitError::Storage)?, count as u64))
                })
                .collect()
        })
        .await
    }
}

#[async_trait]
impl EpisodeLog for SqliteStore {
    async fn append(&self, episode: &Episode) -> Result<()> {
        let episode = episode.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO episodes (id, decision_type, state, action, reward, next_state, terminal, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    episode.id.to_string(),
                    episode.decision_type.as_str(),
                    serde_json::to_string(&episode.state)?,
                    serde_json::to_string(&episode.action)?,
                    episode.reward,
                    episode.next_state.as_ref().map(serde_json::to_string).transpose()?,
                    episode.terminal as i64,
                    ts(&episode.recorded_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn load(&self, decision_type: DecisionType) -> Result<Vec<Episode>> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, decision_type, state, action, reward, next_state, terminal, recorded_at
                     FROM episodes WHERE decision_type = ?1 ORDER BY seq ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(rusqlite::params![decision_type.as_str()], EpisodeRow::read)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(EpisodeRow::decode).collect()
        })
        .await
    }

    async fn counts(&self) -> Result<Vec<(DecisionType, u64)>> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare("SELECT decision_type, COUNT(*) FROM episodes GROUP BY decision_type ORDER BY decision_type")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter()
                .map(|(dt, count)| -> Result<(DecisionType, u64)> {
                    Ok((dt.parse().map_err(ConduitError::Storage)?, count as u64))
                })
                .collect()
        })
        .await
    }
}
