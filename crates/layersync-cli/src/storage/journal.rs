//! Change journal reader
//!
//! Turns the rows the triggers append to `feature_changes` into
//! [`LocalChange`]s for the adapter. Each processed row is deleted so the
//! table only ever holds what has not been read yet.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use layersync_core::{HostError, LayerId, LocalChange, LocalChangeKind, LocalId};

use super::host::{connect, load_feature, load_layer, store_err};

struct Entry {
    seq: i64,
    layer: String,
    fid: Option<i64>,
    kind: String,
}

/// Reader over the feature file's change journal
pub struct ChangeJournal {
    conn: Connection,
    cursor: i64,
}

impl ChangeJournal {
    /// Open the journal, skipping everything recorded before now
    ///
    /// Edits made while nothing was watching are not replayed; subscribing
    /// reconciles the file with the remote instead.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = connect(path)?;
        let cursor: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM feature_changes",
            [],
            |row| row.get(0),
        )?;
        conn.execute("DELETE FROM feature_changes WHERE seq <= ?1", params![cursor])?;
        Ok(Self { conn, cursor })
    }

    /// Read every change recorded since the last poll
    pub fn poll(&mut self) -> Result<Vec<LocalChange>, HostError> {
        let entries = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT seq, layer_id, fid, kind FROM feature_changes \
                     WHERE seq > ?1 ORDER BY seq",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![self.cursor], |row| {
                    Ok(Entry {
                        seq: row.get(0)?,
                        layer: row.get(1)?,
                        fid: row.get(2)?,
                        kind: row.get(3)?,
                    })
                })
                .map_err(store_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err)?;
            rows
        };

        let Some(last) = entries.last().map(|e| e.seq) else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.read_entry(&entry)? {
                Some(change) => changes.push(change),
                None => debug!("Skipping journal entry {} ({})", entry.seq, entry.kind),
            }
        }

        self.cursor = last;
        self.conn
            .execute("DELETE FROM feature_changes WHERE seq <= ?1", params![last])
            .map_err(store_err)?;
        Ok(changes)
    }

    fn read_entry(&self, entry: &Entry) -> Result<Option<LocalChange>, HostError> {
        let layer: LayerId = match entry.layer.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!("Journal entry {} has invalid layer id {:?}", entry.seq, entry.layer);
                return Ok(None);
            }
        };

        match (entry.kind.as_str(), entry.fid) {
            ("insert", Some(fid)) => Ok(load_feature(&self.conn, layer, LocalId(fid))?
                .map(|feature| LocalChange::insert(layer, feature))),
            ("update", Some(fid)) => Ok(load_feature(&self.conn, layer, LocalId(fid))?
                .map(|feature| LocalChange::update(layer, feature))),
            ("delete", Some(fid)) => Ok(Some(LocalChange::delete(layer, LocalId(fid)))),
            ("schema", _) => Ok(load_layer(&self.conn, layer)?.map(|info| LocalChange {
                layer,
                kind: LocalChangeKind::SchemaChanged(info.attributes),
            })),
            _ => {
                warn!("Unknown journal entry {} of kind {:?}", entry.seq, entry.kind);
                Ok(None)
            }
        }
    }

    /// Poll on a blocking thread every `interval` until `tx` closes
    pub fn spawn(self, interval: Duration, tx: mpsc::Sender<LocalChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut journal = self;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tx.closed() => break,
                }

                let polled = tokio::task::spawn_blocking(move || {
                    let changes = journal.poll();
                    (journal, changes)
                })
                .await;

                let changes = match polled {
                    Ok((returned, changes)) => {
                        journal = returned;
                        changes
                    }
                    Err(e) => {
                        warn!("Change journal task failed: {}", e);
                        break;
                    }
                };

                match changes {
                    Ok(changes) => {
                        for change in changes {
                            if tx.send(change).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Failed to read change journal: {}", e),
                }
            }
            debug!("Change journal stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteHost;
    use layersync_core::{
        AttributeType, HostMutation, HostStore, LayerAttribute, LayerInfo, LocalFeature, Point3,
        RemoteId,
    };
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteHost, LayerInfo) {
        let dir = TempDir::new().unwrap();
        let mut host = SqliteHost::open(&dir.path().join("features.db")).unwrap();
        let layer = LayerInfo::new("signs", 4326)
            .with_attribute(LayerAttribute::new("code", AttributeType::Text));
        host.open_layer(&layer).unwrap();
        (dir, host, layer)
    }

    fn journal(dir: &TempDir) -> ChangeJournal {
        ChangeJournal::open(&dir.path().join("features.db")).unwrap()
    }

    #[test]
    fn test_poll_reports_user_edits() {
        let (dir, host, layer) = setup();
        let mut journal = journal(&dir);

        let id = host
            .add_point(layer.id, &LocalFeature::new(Point3::new(1.0, 2.0, 0.0)))
            .unwrap();
        host.edit_point(layer.id, id, |f| f.geometry.x = 5.0).unwrap();

        let changes = journal.poll().unwrap();
        assert_eq!(changes.len(), 2);
        match &changes[0].kind {
            LocalChangeKind::Insert(f) => {
                assert_eq!(f.local_id, Some(id));
                // The current row is read, not the row as first inserted
                assert_eq!(f.geometry.x, 5.0);
            }
            other => panic!("unexpected change {:?}", other),
        }
        assert!(matches!(changes[1].kind, LocalChangeKind::Update(_)));

        // Processed entries are gone
        assert!(journal.poll().unwrap().is_empty());

        host.delete_point(layer.id, id).unwrap();
        assert_eq!(journal.poll().unwrap(), vec![LocalChange::delete(layer.id, id)]);
    }

    #[test]
    fn test_insert_of_deleted_feature_is_skipped() {
        let (dir, host, layer) = setup();
        let mut journal = journal(&dir);

        let id = host
            .add_point(layer.id, &LocalFeature::new(Point3::new(1.0, 2.0, 0.0)))
            .unwrap();
        host.delete_point(layer.id, id).unwrap();

        assert_eq!(journal.poll().unwrap(), vec![LocalChange::delete(layer.id, id)]);
    }

    #[test]
    fn test_adapter_mutations_echo_but_tagging_does_not() {
        let (dir, mut host, layer) = setup();
        let mut journal = journal(&dir);

        let id = host
            .apply_feature(
                layer.id,
                HostMutation::Insert(LocalFeature::new(Point3::new(0.0, 0.0, 0.0))),
            )
            .unwrap()
            .unwrap();
        host.tag_feature(layer.id, id, Some(RemoteId::new())).unwrap();

        let changes = journal.poll().unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0].kind, LocalChangeKind::Insert(_)));
    }

    #[test]
    fn test_schema_change_reports_new_attributes() {
        let (dir, host, layer) = setup();
        let mut journal = journal(&dir);

        let attrs = vec![
            LayerAttribute::new("code", AttributeType::Text),
            LayerAttribute::new("height", AttributeType::Float),
        ];
        host.set_schema(layer.id, &attrs).unwrap();

        let changes = journal.poll().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, LocalChangeKind::SchemaChanged(attrs));
    }

    #[test]
    fn test_open_skips_earlier_edits() {
        let (dir, host, layer) = setup();
        host.add_point(layer.id, &LocalFeature::new(Point3::new(1.0, 2.0, 0.0)))
            .unwrap();

        let mut journal = journal(&dir);
        assert!(journal.poll().unwrap().is_empty());

        let count: i64 = host
            .connection()
            .query_row("SELECT COUNT(*) FROM feature_changes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_spawn_forwards_changes() {
        let (dir, host, layer) = setup();
        let (tx, mut rx) = mpsc::channel(16);
        let task = journal(&dir).spawn(Duration::from_millis(10), tx);

        let id = host
            .add_point(layer.id, &LocalFeature::new(Point3::new(1.0, 2.0, 0.0)))
            .unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.layer, layer.id);
        assert!(matches!(change.kind, LocalChangeKind::Insert(ref f) if f.local_id == Some(id)));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
