//! Face registry backed by SQLite.
//!
//! All statements run on the single `tokio_rusqlite` connection thread, so
//! writes are serialized globally. Every mutation is one transaction:
//! concurrent readers observe either the state before or after it.

use crate::types::{Embedding, Entry, EntrySummary, Group};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
  display_name TEXT NOT NULL,
  embedding BLOB NOT NULL,
  image_reference TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_group ON entries(group_id, id);
"#;

const ENTRY_COLUMNS: &str = "id, group_id, display_name, embedding, image_reference, created_at";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown group {0}")]
    UnknownGroup(i64),
    #[error("unknown entry {0}")]
    UnknownEntry(i64),
    #[error("group {0:?} already exists")]
    DuplicateGroup(String),
    #[error("group name must not be empty")]
    EmptyGroupName,
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("database holds {stored}-dim embeddings, extractor produces {configured}-dim")]
    DimensionMismatch { stored: usize, configured: usize },
    #[error("storage: {0}")]
    Storage(#[from] tokio_rusqlite::Error),
}

/// Durable group/entry store with a fixed embedding dimensionality.
#[derive(Clone)]
pub struct Registry {
    conn: Connection,
    dimension: usize,
}

impl Registry {
    /// Open (or create) the database file at `path`.
    ///
    /// The first open records `dimension`; later opens with a different
    /// value fail with [`RegistryError::DimensionMismatch`].
    pub async fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, RegistryError> {
        let conn = Connection::open(path.as_ref()).await?;
        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        })
        .await?;
        Self::init(conn, dimension).await
    }

    /// Open a private in-memory database. Used by tests and dry runs.
    pub async fn open_in_memory(dimension: usize) -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, dimension).await
    }

    async fn init(conn: Connection, dimension: usize) -> Result<Self, RegistryError> {
        if dimension == 0 {
            return Err(RegistryError::InvalidEmbedding(
                "canonical dimensionality must be positive".into(),
            ));
        }

        let stored = conn
            .call(move |conn| {
                conn.pragma_update(None, "foreign_keys", "ON")?;
                conn.execute_batch(SCHEMA)?;
                let tx = conn.transaction()?;
                let stored: Option<i64> = tx
                    .query_row(
                        "SELECT CAST(value AS INTEGER) FROM meta WHERE key = 'dimension'",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                if stored.is_none() {
                    tx.execute(
                        "INSERT INTO meta (key, value) VALUES ('dimension', ?1)",
                        [dimension.to_string()],
                    )?;
                }
                tx.commit()?;
                Ok(stored)
            })
            .await?;

        if let Some(stored) = stored {
            let stored = stored as usize;
            if stored != dimension {
                return Err(RegistryError::DimensionMismatch {
                    stored,
                    configured: dimension,
                });
            }
        }

        tracing::debug!(dimension, "registry ready");
        Ok(Self { conn, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Reject empty, non-finite or wrongly sized vectors.
    ///
    /// A failure here means the extractor or caller broke its contract, so it
    /// is logged as an internal inconsistency.
    pub fn check_embedding(&self, embedding: &Embedding) -> Result<(), RegistryError> {
        let reason = if embedding.values.is_empty() {
            Some("embedding is empty".to_string())
        } else if embedding.dimension() != self.dimension {
            Some(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                embedding.dimension()
            ))
        } else if !embedding.is_finite() {
            Some("embedding contains non-finite values".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => {
                tracing::error!(%reason, "embedding contract violation");
                Err(RegistryError::InvalidEmbedding(reason))
            }
            None => Ok(()),
        }
    }

    pub async fn create_group(&self, name: &str) -> Result<Group, RegistryError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::EmptyGroupName);
        }
        let created_at = now();

        let row = {
            let name = name.clone();
            let created_at = created_at.clone();
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    let taken = tx
                        .query_row("SELECT 1 FROM groups WHERE name = ?1", [&name], |_| Ok(()))
                        .optional()?
                        .is_some();
                    if taken {
                        return Ok(None);
                    }
                    tx.execute(
                        "INSERT INTO groups (name, created_at) VALUES (?1, ?2)",
                        params![name, created_at],
                    )?;
                    let id = tx.last_insert_rowid();
                    tx.commit()?;
                    Ok(Some(id))
                })
                .await?
        };

        match row {
            Some(id) => {
                tracing::info!(group_id = id, name = %name, "group created");
                Ok(Group {
                    id,
                    name,
                    created_at,
                })
            }
            None => Err(RegistryError::DuplicateGroup(name)),
        }
    }

    pub async fn get_group(&self, group_id: i64) -> Result<Option<Group>, RegistryError> {
        let group = self
            .conn
            .call(move |conn| {
                let group = conn
                    .query_row(
                        "SELECT id, name, created_at FROM groups WHERE id = ?1",
                        [group_id],
                        group_from_row,
                    )
                    .optional()?;
                Ok(group)
            })
            .await?;
        Ok(group)
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, RegistryError> {
        let groups = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, name, created_at FROM groups ORDER BY id")?;
                let groups = stmt
                    .query_map([], group_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(groups)
            })
            .await?;
        Ok(groups)
    }

    /// Remove a group and all of its entries in one transaction.
    ///
    /// Returns the removed entries so their stored images can be cleaned up.
    pub async fn delete_group(&self, group_id: i64) -> Result<Vec<Entry>, RegistryError> {
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let entries = select_entries(&tx, group_id)?;
                tx.execute("DELETE FROM entries WHERE group_id = ?1", [group_id])?;
                let deleted = tx.execute("DELETE FROM groups WHERE id = ?1", [group_id])?;
                if deleted == 0 {
                    return Ok(None);
                }
                tx.commit()?;
                Ok(Some(entries))
            })
            .await?;

        let entries = removed.ok_or(RegistryError::UnknownGroup(group_id))?;
        tracing::info!(group_id, entries = entries.len(), "group deleted");
        Ok(entries)
    }

    /// Persist a new entry. The id is assigned and the row written atomically.
    pub async fn add_entry(
        &self,
        group_id: i64,
        display_name: &str,
        embedding: Embedding,
    ) -> Result<Entry, RegistryError> {
        self.check_embedding(&embedding)?;

        let display_name = display_name.to_string();
        let created_at = now();
        let blob = embedding.to_le_bytes();

        let inserted = {
            let display_name = display_name.clone();
            let created_at = created_at.clone();
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    let exists = tx
                        .query_row("SELECT 1 FROM groups WHERE id = ?1", [group_id], |_| Ok(()))
                        .optional()?
                        .is_some();
                    if !exists {
                        return Ok(None);
                    }
                    tx.execute(
                        "INSERT INTO entries (group_id, display_name, embedding, created_at) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![group_id, display_name, blob, created_at],
                    )?;
                    let id = tx.last_insert_rowid();
                    tx.commit()?;
                    Ok(Some(id))
                })
                .await?
        };

        let id = inserted.ok_or(RegistryError::UnknownGroup(group_id))?;
        tracing::debug!(group_id, entry_id = id, "entry stored");
        Ok(Entry {
            id,
            group_id,
            display_name,
            embedding,
            image_reference: None,
            created_at,
        })
    }

    /// Entries of `group_id` in creation order. Unknown groups yield an empty list.
    pub async fn list_entries(&self, group_id: i64) -> Result<Vec<Entry>, RegistryError> {
        let entries = self
            .conn
            .call(move |conn| Ok(select_entries(conn, group_id)?))
            .await?;
        Ok(entries)
    }

    /// Every entry across all groups, for administration.
    pub async fn list_all_entries(&self) -> Result<Vec<EntrySummary>, RegistryError> {
        let entries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.id, e.display_name, e.group_id, g.name, e.image_reference \
                     FROM entries e JOIN groups g ON g.id = e.group_id ORDER BY e.id",
                )?;
                let entries = stmt
                    .query_map([], |row| {
                        Ok(EntrySummary {
                            id: row.get(0)?,
                            display_name: row.get(1)?,
                            group_id: row.get(2)?,
                            group_name: row.get(3)?,
                            image_reference: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    /// Attach the image store handle to an existing entry.
    pub async fn set_image_reference(
        &self,
        entry_id: i64,
        reference: &str,
    ) -> Result<(), RegistryError> {
        let reference = reference.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE entries SET image_reference = ?2 WHERE id = ?1",
                    params![entry_id, reference],
                )?;
                Ok(n)
            })
            .await?;
        if updated == 0 {
            return Err(RegistryError::UnknownEntry(entry_id));
        }
        Ok(())
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let blob: Vec<u8> = row.get(3)?;
    Ok(Entry {
        id: row.get(0)?,
        group_id: row.get(1)?,
        display_name: row.get(2)?,
        embedding: Embedding::from_le_bytes(&blob),
        image_reference: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn select_entries(conn: &rusqlite::Connection, group_id: i64) -> rusqlite::Result<Vec<Entry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE group_id = ?1 ORDER BY id"
    ))?;
    let entries = stmt
        .query_map([group_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    async fn registry() -> Registry {
        Registry::open_in_memory(4).await.unwrap()
    }

    #[tokio::test]
    async fn test_group_names_are_unique() {
        let reg = registry().await;
        let wedding = reg.create_group("Wedding").await.unwrap();
        assert_eq!(wedding.id, 1);

        let err = reg.create_group("Wedding").await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateGroup(ref n) if n == "Wedding"));

        // Case-sensitive exact match
        reg.create_group("wedding").await.unwrap();
        let names: Vec<_> = reg.list_groups().await.unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["Wedding", "wedding"]);
    }

    #[tokio::test]
    async fn test_empty_group_name_rejected() {
        let reg = registry().await;
        assert!(matches!(reg.create_group("  ").await, Err(RegistryError::EmptyGroupName)));
    }

    #[tokio::test]
    async fn test_get_group_missing_is_none() {
        let reg = registry().await;
        assert!(reg.get_group(42).await.unwrap().is_none());
        let g = reg.create_group("Gala").await.unwrap();
        assert_eq!(reg.get_group(g.id).await.unwrap(), Some(g));
    }

    #[tokio::test]
    async fn test_add_entry_unknown_group() {
        let reg = registry().await;
        let err = reg.add_entry(9, "Alice", emb(&[0.0; 4])).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownGroup(9)));
        assert!(reg.list_all_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_entry_rejects_bad_embeddings() {
        let reg = registry().await;
        let g = reg.create_group("Gala").await.unwrap();
        for bad in [emb(&[]), emb(&[0.0; 3]), emb(&[0.0, 0.0, f32::NAN, 0.0])] {
            let err = reg.add_entry(g.id, "X", bad).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidEmbedding(_)));
        }
        assert!(reg.list_entries(g.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_listed_in_creation_order() {
        let reg = registry().await;
        let g = reg.create_group("Wedding").await.unwrap();
        let other = reg.create_group("Other").await.unwrap();

        let alice = reg.add_entry(g.id, "Alice", emb(&[1.0, 0.0, 0.0, 0.0])).await.unwrap();
        reg.add_entry(other.id, "Carol", emb(&[0.0; 4])).await.unwrap();
        let bob = reg.add_entry(g.id, "Bob", emb(&[0.0, 1.0, 0.0, 0.0])).await.unwrap();

        let entries = reg.list_entries(g.id).await.unwrap();
        assert_eq!(entries, vec![alice.clone(), bob]);
        assert_eq!(entries[0].embedding, alice.embedding);
        assert!(reg.list_entries(777).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_see_whole_entries() {
        let reg = registry().await;
        let group_id = reg.create_group("Rush").await.unwrap().id;

        let mut writers = Vec::new();
        for i in 0..24 {
            let reg = reg.clone();
            writers.push(tokio::spawn(async move {
                reg.add_entry(group_id, &format!("guest-{i}"), emb(&[i as f32; 4])).await.unwrap()
            }));
        }

        let reader = {
            let reg = reg.clone();
            tokio::spawn(async move {
                let mut snapshots = Vec::new();
                for _ in 0..50 {
                    snapshots.push(reg.list_entries(group_id).await.unwrap());
                    tokio::task::yield_now().await;
                }
                snapshots
            })
        };

        for w in writers {
            w.await.unwrap();
        }
        let snapshots = reader.await.unwrap();
        let last = reg.list_entries(group_id).await.unwrap();
        assert_eq!(last.len(), 24);
        assert!(last.windows(2).all(|w| w[0].id < w[1].id));

        for snap in snapshots {
            assert_eq!(snap[..], last[..snap.len()]);
            assert!(snap.iter().all(|e| e.embedding.dimension() == 4));
        }
    }

    #[tokio::test]
    async fn test_delete_group_cascades() {
        let reg = registry().await;
        let g = reg.create_group("Wedding").await.unwrap();
        let keep = reg.create_group("Keep").await.unwrap();
        reg.add_entry(g.id, "Alice", emb(&[0.0; 4])).await.unwrap();
        reg.add_entry(g.id, "Bob", emb(&[1.0; 4])).await.unwrap();
        reg.add_entry(keep.id, "Carol", emb(&[2.0; 4])).await.unwrap();

        let removed = reg.delete_group(g.id).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(reg.get_group(g.id).await.unwrap().is_none());
        assert!(reg.list_entries(g.id).await.unwrap().is_empty());

        let remaining = reg.list_all_entries().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].group_name, "Keep");

        assert!(matches!(reg.delete_group(g.id).await, Err(RegistryError::UnknownGroup(_))));
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_after_delete() {
        let reg = registry().await;
        let g = reg.create_group("A").await.unwrap();
        let first = reg.add_entry(g.id, "x", emb(&[0.0; 4])).await.unwrap();
        reg.delete_group(g.id).await.unwrap();
        let g2 = reg.create_group("A").await.unwrap();
        let second = reg.add_entry(g2.id, "x", emb(&[0.0; 4])).await.unwrap();
        assert!(g2.id > g.id);
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_set_image_reference() {
        let reg = registry().await;
        let g = reg.create_group("A").await.unwrap();
        let e = reg.add_entry(g.id, "x", emb(&[0.0; 4])).await.unwrap();
        reg.set_image_reference(e.id, "faces/1.jpg").await.unwrap();
        let stored = reg.list_entries(g.id).await.unwrap();
        assert_eq!(stored[0].image_reference.as_deref(), Some("faces/1.jpg"));
        assert!(matches!(
            reg.set_image_reference(99, "nope").await,
            Err(RegistryError::UnknownEntry(99))
        ));
    }

    #[tokio::test]
    async fn test_reopen_with_other_dimension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.db");
        {
            let reg = Registry::open(&path, 4).await.unwrap();
            let g = reg.create_group("Persisted").await.unwrap();
            reg.add_entry(g.id, "x", emb(&[0.5; 4])).await.unwrap();
        }
        let reg = Registry::open(&path, 4).await.unwrap();
        assert_eq!(reg.list_groups().await.unwrap()[0].name, "Persisted");
        assert_eq!(reg.list_entries(1).await.unwrap()[0].embedding, emb(&[0.5; 4]));

        let err = Registry::open(&path, 128).await.err().unwrap();
        assert!(matches!(err, RegistryError::DimensionMismatch { stored: 4, configured: 128 }));
    }
}
