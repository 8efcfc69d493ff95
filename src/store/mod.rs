use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// How the next message collection is chosen for a dispatch event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    #[default]
    Random,
    Sequential,
}

impl SendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Sequential => "sequential",
        }
    }
}

impl TryFrom<&str> for SendMode {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "random" => Ok(SendMode::Random),
            "sequential" => Ok(SendMode::Sequential),
            _ => Err(format!(
                "Invalid send mode '{}'. Expected one of: 'random', 'sequential'",
                value
            )),
        }
    }
}

/// The singleton bot configuration, with its owned destinations and
/// message collections. At most one exists at a time; `apply` replaces it
/// wholesale.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub id: String,
    pub token: String,
    pub interval_minutes: i64,
    pub send_mode: SendMode,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub destinations: Vec<Destination>,
    pub collections: Vec<MessageCollection>,
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub chat_id: String,
    pub name: String,
    /// None means never sent — always due.
    pub last_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MessageCollection {
    pub name: String,
    pub sort_order: i64,
    /// Ordered by position; always sent together as one unit.
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub content: String,
    pub position: i64,
}

/// Declarative input for `replace_config`, deserializable from the TOML
/// file given to `groupcast apply`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfigSpec {
    pub token: String,
    pub interval_minutes: i64,
    #[serde(default)]
    pub send_mode: SendMode,
    #[serde(default)]
    pub destinations: Vec<DestinationSpec>,
    #[serde(default)]
    pub collections: Vec<CollectionSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSpec {
    pub chat_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    /// Rotation order for sequential mode. Defaults to file order.
    #[serde(default)]
    pub sort_order: Option<i64>,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// SQLite-backed configuration store. Opens the database per call and
/// initializes the schema on first touch, so a fresh workspace needs no
/// setup step.
pub struct ConfigStore {
    db_path: PathBuf,
}

impl ConfigStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// The configuration currently marked active, or None when there is
    /// none or it is switched off.
    pub fn active_config(&self) -> Result<Option<BotConfig>> {
        self.with_connection(|conn| load_config(conn, true))
    }

    /// The stored configuration regardless of the active flag.
    pub fn current_config(&self) -> Result<Option<BotConfig>> {
        self.with_connection(|conn| load_config(conn, false))
    }

    /// Atomically replace the stored configuration. The previous record
    /// tree is deleted and the new one inserted in a single transaction,
    /// so a concurrent reader sees either the old configuration in full
    /// or the new one in full. The new configuration starts inactive.
    pub fn replace_config(&self, spec: &BotConfigSpec) -> Result<BotConfig> {
        if spec.token.trim().is_empty() {
            anyhow::bail!("Bot token must not be empty");
        }
        if spec.interval_minutes < 1 {
            anyhow::bail!(
                "Send interval must be at least 1 minute, got {}",
                spec.interval_minutes
            );
        }

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        self.with_connection(|conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;

            tx.execute("DELETE FROM messages", [])?;
            tx.execute("DELETE FROM collections", [])?;
            tx.execute("DELETE FROM destinations", [])?;
            tx.execute("DELETE FROM bot_config", [])?;

            tx.execute(
                "INSERT INTO bot_config (id, token, interval_minutes, send_mode, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    id,
                    spec.token,
                    spec.interval_minutes,
                    spec.send_mode.as_str(),
                    created_at.to_rfc3339()
                ],
            )
            .context("Failed to insert bot configuration")?;

            for dest in &spec.destinations {
                tx.execute(
                    "INSERT INTO destinations (config_id, chat_id, name) VALUES (?1, ?2, ?3)",
                    params![id, dest.chat_id, dest.name],
                )
                .with_context(|| format!("Failed to insert destination {}", dest.chat_id))?;
            }

            for (index, collection) in spec.collections.iter().enumerate() {
                let sort_order = collection.sort_order.unwrap_or(index as i64);
                tx.execute(
                    "INSERT INTO collections (config_id, name, sort_order) VALUES (?1, ?2, ?3)",
                    params![id, collection.name, sort_order],
                )
                .with_context(|| format!("Failed to insert collection {}", collection.name))?;

                for (position, content) in collection.messages.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO messages (config_id, collection_name, position, content)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id, collection.name, position as i64, content],
                    )
                    .with_context(|| {
                        format!("Failed to insert message into {}", collection.name)
                    })?;
                }
            }

            tx.commit().context("Failed to commit configuration replace")?;

            load_config(&*conn, false)?
                .context("Configuration vanished right after replace")
        })
    }

    /// Toggle the active flag. Returns false when no configuration exists.
    pub fn set_active(&self, active: bool) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE bot_config SET active = ?1",
                    params![i64::from(active)],
                )
                .context("Failed to update active flag")?;
            Ok(changed > 0)
        })
    }

    /// Record a fully successful collection send for one destination.
    /// Returns false when the destination no longer exists (replaced
    /// configuration) — the caller treats that as a no-op.
    pub fn update_last_sent(&self, chat_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE destinations SET last_sent_at = ?1 WHERE chat_id = ?2",
                    params![at.to_rfc3339(), chat_id],
                )
                .context("Failed to update last-sent timestamp")?;
            Ok(changed > 0)
        })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let mut conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open store DB: {}", self.db_path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bot_config (
                id               TEXT PRIMARY KEY,
                token            TEXT NOT NULL,
                interval_minutes INTEGER NOT NULL,
                send_mode        TEXT NOT NULL,
                active           INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS destinations (
                config_id    TEXT NOT NULL,
                chat_id      TEXT NOT NULL,
                name         TEXT NOT NULL,
                last_sent_at TEXT,
                PRIMARY KEY (config_id, chat_id)
            );
            CREATE TABLE IF NOT EXISTS collections (
                config_id  TEXT NOT NULL,
                name       TEXT NOT NULL,
                sort_order INTEGER NOT NULL,
                PRIMARY KEY (config_id, name)
            );
            CREATE TABLE IF NOT EXISTS messages (
                config_id       TEXT NOT NULL,
                collection_name TEXT NOT NULL,
                position        INTEGER NOT NULL,
                content         TEXT NOT NULL,
                PRIMARY KEY (config_id, collection_name, position)
            );",
        )
        .context("Failed to initialize store schema")?;

        f(&mut conn)
    }
}

fn load_config(conn: &Connection, only_active: bool) -> Result<Option<BotConfig>> {
    let sql = if only_active {
        "SELECT id, token, interval_minutes, send_mode, active, created_at
         FROM bot_config WHERE active = 1 LIMIT 1"
    } else {
        "SELECT id, token, interval_minutes, send_mode, active, created_at
         FROM bot_config LIMIT 1"
    };

    let mut stmt = conn.prepare(sql)?;
    let row = stmt.query_row([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, i64>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, i64>(4)? != 0,
            r.get::<_, String>(5)?,
        ))
    });

    let (id, token, interval_minutes, send_mode_raw, active, created_at_raw) = match row {
        Ok(v) => v,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let send_mode =
        SendMode::try_from(send_mode_raw.as_str()).map_err(|e| anyhow::anyhow!(e))?;

    let mut dest_stmt = conn.prepare(
        "SELECT chat_id, name, last_sent_at FROM destinations
         WHERE config_id = ?1 ORDER BY rowid ASC",
    )?;
    let dest_rows = dest_stmt.query_map(params![id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<String>>(2)?,
        ))
    })?;

    let mut destinations = Vec::new();
    for row in dest_rows {
        let (chat_id, name, last_sent_raw) = row?;
        destinations.push(Destination {
            chat_id,
            name,
            last_sent_at: match last_sent_raw {
                Some(raw) => Some(parse_rfc3339(&raw)?),
                None => None,
            },
        });
    }

    let mut msg_stmt = conn.prepare(
        "SELECT collection_name, position, content FROM messages
         WHERE config_id = ?1 ORDER BY position ASC",
    )?;
    let msg_rows = msg_stmt.query_map(params![id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, i64>(1)?,
            r.get::<_, String>(2)?,
        ))
    })?;

    let mut messages_by_collection: HashMap<String, Vec<Message>> = HashMap::new();
    for row in msg_rows {
        let (collection_name, position, content) = row?;
        messages_by_collection
            .entry(collection_name)
            .or_default()
            .push(Message { content, position });
    }

    let mut coll_stmt = conn.prepare(
        "SELECT name, sort_order FROM collections
         WHERE config_id = ?1 ORDER BY sort_order ASC, name ASC",
    )?;
    let coll_rows = coll_stmt.query_map(params![id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;

    let mut collections = Vec::new();
    for row in coll_rows {
        let (name, sort_order) = row?;
        let messages = messages_by_collection.remove(&name).unwrap_or_default();
        collections.push(MessageCollection {
            name,
            sort_order,
            messages,
        });
    }

    Ok(Some(BotConfig {
        id,
        token,
        interval_minutes,
        send_mode,
        active,
        created_at: parse_rfc3339(&created_at_raw)?,
        destinations,
        collections,
    }))
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in store DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}
