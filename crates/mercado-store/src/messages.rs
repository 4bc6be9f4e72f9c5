use async_trait::async_trait;
use tracing::{debug, instrument};

use mercado_core::ids::MessageId;
use mercado_core::messages::{ChatMessage, NewMessage};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Append-only chat persistence shared by every worker process.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Every stored message, oldest first.
    async fn get_all(&self) -> Result<Vec<ChatMessage>, StoreError>;

    /// Append one message and return it with its assigned id.
    /// On error nothing is stored.
    async fn save(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.get_all().await?.len() as u64)
    }
}

/// Synchronous access to the `messages` table.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, message), fields(author = %message.author))]
    pub fn append(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        self.db.with_conn(|conn| {
            let id = MessageId::new();
            conn.execute(
                "INSERT INTO messages (id, author, text, timestamp) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), message.author, message.text, message.timestamp],
            )?;
            debug!(message_id = %id, "message appended");
            Ok(message.into_stored(id))
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, author, text, timestamp FROM messages ORDER BY seq ASC")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(ChatMessage {
                    id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
                    author: row_helpers::get(row, 1, "messages", "author")?,
                    text: row_helpers::get(row, 2, "messages", "text")?,
                    timestamp: row_helpers::get(row, 3, "messages", "timestamp")?,
                });
            }
            Ok(out)
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
    }
}

/// [`MessageStore`] backed by SQLite. Queries run on the blocking pool so a
/// busy database file never stalls the socket tasks.
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: Database,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn repo(&self) -> MessageRepo {
        MessageRepo::new(self.db.clone())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn get_all(&self) -> Result<Vec<ChatMessage>, StoreError> {
        let repo = self.repo();
        tokio::task::spawn_blocking(move || repo.list()).await?
    }

    async fn save(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let repo = self.repo();
        tokio::task::spawn_blocking(move || repo.append(message)).await?
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let repo = self.repo();
        tokio::task::spawn_blocking(move || repo.count()).await?
    }
}
