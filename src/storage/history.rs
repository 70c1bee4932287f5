//! Persistent history tracking for the relational store.
//!
//! Every write appends a row to the `history` table inside the same transaction,
//! so a cancelled transaction leaves no trace. A replica resumes reading from a
//! persisted [`HistoryToken`] and ignores rows it authored itself.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use uuid::Uuid;

use crate::errors::Result;
use super::models::{ClipId, TagId};
use super::sqlite::SqliteStorage;

/// Opaque cursor into the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryToken(i64);

impl HistoryToken {
    pub(crate) fn value(&self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Clip,
    ClipItem,
    Tag,
    Album,
    AlbumItem,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Clip => "clip",
            EntityKind::ClipItem => "clip_item",
            EntityKind::Tag => "tag",
            EntityKind::Album => "album",
            EntityKind::AlbumItem => "album_item",
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "clip" => Some(EntityKind::Clip),
            "clip_item" => Some(EntityKind::ClipItem),
            "tag" => Some(EntityKind::Tag),
            "album" => Some(EntityKind::Album),
            "album_item" => Some(EntityKind::AlbumItem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<ChangeKind> {
        match s {
            "insert" => Some(ChangeKind::Insert),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub token: HistoryToken,
    pub author: String,
    pub entity: EntityKind,
    pub object_id: String,
    pub kind: ChangeKind,
    pub recorded_at: DateTime<Utc>,
}

/// Changes read past a token, already filtered by author.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryBatch {
    pub changes: Vec<Change>,
    /// Last token read, including rows that were filtered out.
    pub token: Option<HistoryToken>,
}

impl HistoryBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn object_ids(&self, entity: EntityKind, kinds: &[ChangeKind]) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for change in &self.changes {
            if change.entity == entity
                && kinds.contains(&change.kind)
                && !ids.contains(&change.object_id.as_str())
            {
                ids.push(&change.object_id);
            }
        }
        ids
    }

    /// Tags inserted or updated by another author, in log order.
    pub fn inserted_or_updated_tag_ids(&self) -> Vec<TagId> {
        self.object_ids(EntityKind::Tag, &[ChangeKind::Insert, ChangeKind::Update])
            .into_iter()
            .filter_map(|id| id.parse().ok())
            .collect()
    }

    pub fn deleted_clip_ids(&self) -> Vec<ClipId> {
        self.object_ids(EntityKind::Clip, &[ChangeKind::Delete])
            .into_iter()
            .filter_map(|id| id.parse().ok())
            .collect()
    }
}

/// A fresh author id for an install or a connection that never syncs.
pub fn new_author() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn record(
    conn: &Connection,
    author: &str,
    entity: EntityKind,
    object_id: &str,
    kind: ChangeKind,
) -> Result<()> {
    conn.execute(
        "INSERT INTO history (author, entity, object_id, change, recorded_at) VALUES (?, ?, ?, ?, ?)",
        params![author, entity.as_str(), object_id, kind.as_str(), Utc::now()],
    )?;
    Ok(())
}

fn row_to_change(row: &Row) -> rusqlite::Result<Option<Change>> {
    let entity: String = row.get(2)?;
    let kind: String = row.get(4)?;
    let (Some(entity), Some(kind)) = (EntityKind::parse(&entity), ChangeKind::parse(&kind)) else {
        return Ok(None);
    };
    Ok(Some(Change {
        token: HistoryToken(row.get(0)?),
        author: row.get(1)?,
        entity,
        object_id: row.get(3)?,
        kind,
        recorded_at: row.get(5)?,
    }))
}

pub(crate) fn read_since(
    conn: &Connection,
    after: Option<HistoryToken>,
    excluding_author: &str,
) -> Result<HistoryBatch> {
    let mut stmt = conn.prepare(
        "SELECT token, author, entity, object_id, change, recorded_at
         FROM history WHERE token > ? ORDER BY token",
    )?;
    let rows = stmt
        .query_map(params![after.map(|t| t.0).unwrap_or(0)], |row| {
            Ok((row.get::<_, i64>(0)?, row_to_change(row)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // The token only advances over rows this read returned, whoever wrote them.
    let token = rows.iter().map(|(token, _)| *token).max().map(HistoryToken).or(after);
    Ok(HistoryBatch {
        changes: rows
            .into_iter()
            .filter_map(|(_, change)| change)
            .filter(|c| c.author != excluding_author)
            .collect(),
        token,
    })
}

pub(crate) fn purge_before(conn: &Connection, token: HistoryToken) -> Result<usize> {
    let removed = conn.execute("DELETE FROM history WHERE token <= ?", params![token.0])?;
    Ok(removed)
}

/// Persists the last consumed token as a small JSON document.
pub struct HistoryTokenStore {
    path: PathBuf,
}

impl HistoryTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<HistoryToken>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, token: HistoryToken) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&token)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reads remote-originated changes and advances the persisted token.
pub struct RemoteChangeMonitor {
    tokens: HistoryTokenStore,
}

impl RemoteChangeMonitor {
    pub fn new(tokens: HistoryTokenStore) -> Self {
        Self { tokens }
    }

    /// Returns the changes other authors made since the last poll. The token is
    /// saved only after the read succeeded.
    pub fn poll(&self, storage: &SqliteStorage) -> Result<HistoryBatch> {
        let after = self.tokens.load()?;
        let batch = storage.changes_since(after)?;
        if let Some(token) = batch.token
            && Some(token) != after
        {
            self.tokens.save(token)?;
        }
        debug!(changes = batch.changes.len(), "polled remote history");
        Ok(batch)
    }

    /// Drops log rows every consumer has already read.
    pub fn purge_consumed(&self, storage: &SqliteStorage) -> Result<usize> {
        match self.tokens.load()? {
            Some(token) => storage.purge_history(token),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;
    use tempfile::TempDir;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(schema::CREATE_HISTORY_TABLE, []).unwrap();
        conn
    }

    #[test]
    fn test_entity_kind_round_trip() {
        for kind in [EntityKind::Clip, EntityKind::ClipItem, EntityKind::Tag, EntityKind::Album, EntityKind::AlbumItem] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("photo"), None);
    }

    #[test]
    fn test_read_since_filters_own_author() {
        let conn = conn();
        record(&conn, "me", EntityKind::Tag, "a", ChangeKind::Insert).unwrap();
        record(&conn, "remote", EntityKind::Tag, "b", ChangeKind::Insert).unwrap();
        let batch = read_since(&conn, None, "me").unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].object_id, "b");
        assert_eq!(batch.token, Some(HistoryToken(2)));
    }

    #[test]
    fn test_read_since_advances_past_own_rows() {
        let conn = conn();
        record(&conn, "me", EntityKind::Clip, "a", ChangeKind::Delete).unwrap();
        let batch = read_since(&conn, None, "me").unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.token, Some(HistoryToken(1)));
        let again = read_since(&conn, batch.token, "me").unwrap();
        assert_eq!(again.token, Some(HistoryToken(1)));
    }

    #[test]
    fn test_read_since_token_comes_from_returned_rows() {
        let conn = conn();
        record(&conn, "remote", EntityKind::Tag, "a", ChangeKind::Insert).unwrap();
        conn.execute(
            "INSERT INTO history (author, entity, object_id, change, recorded_at) VALUES ('remote', 'photo', 'x', 'insert', ?)",
            params![Utc::now()],
        )
        .unwrap();
        let batch = read_since(&conn, None, "me").unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.token, Some(HistoryToken(2)));

        let empty = read_since(&conn, Some(HistoryToken(7)), "me").unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.token, Some(HistoryToken(7)));
    }

    #[test]
    fn test_batch_groups_tag_ids() {
        let conn = conn();
        let tag = TagId::new();
        record(&conn, "remote", EntityKind::Tag, &tag.to_string(), ChangeKind::Insert).unwrap();
        record(&conn, "remote", EntityKind::Tag, &tag.to_string(), ChangeKind::Update).unwrap();
        record(&conn, "remote", EntityKind::Tag, &TagId::new().to_string(), ChangeKind::Delete).unwrap();
        let batch = read_since(&conn, None, "me").unwrap();
        assert_eq!(batch.inserted_or_updated_tag_ids(), vec![tag]);
    }

    #[test]
    fn test_purge_before() {
        let conn = conn();
        record(&conn, "a", EntityKind::Tag, "x", ChangeKind::Insert).unwrap();
        record(&conn, "a", EntityKind::Tag, "y", ChangeKind::Insert).unwrap();
        assert_eq!(purge_before(&conn, HistoryToken(1)).unwrap(), 1);
    }

    #[test]
    fn test_token_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = HistoryTokenStore::new(dir.path().join("sync/token.json"));
        assert_eq!(store.load().unwrap(), None);
        store.save(HistoryToken(42)).unwrap();
        assert_eq!(store.load().unwrap(), Some(HistoryToken(42)));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
