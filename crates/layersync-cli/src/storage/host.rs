//! SQLite-backed host
//!
//! The local feature file the `point` commands edit and the watcher keeps in
//! sync. Mutations applied by the adapter go through the same tables as user
//! edits, so they come back through the change journal like a desktop host's
//! change signals do.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use layersync_core::{
    AttributeValue, HostError, HostMutation, HostStore, LayerAttribute, LayerId, LayerInfo,
    LocalFeature, LocalId, Point3, RemoteId,
};

use super::schema::{init_schema, needs_init};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const FEATURE_COLUMNS: &str = "fid, x, y, z, attributes, remote_id";

const LAYER_COLUMNS: &str = "id, name, geometry_type, srid, attributes, parent_id";

pub(crate) fn store_err(e: impl fmt::Display) -> HostError {
    HostError::Store(e.to_string())
}

/// Open a connection to the feature file, creating it if needed
pub(crate) fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open feature file at {:?}", path))?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if needs_init(conn) {
        init_schema(conn).context("Failed to initialize feature file schema")?;
    }
    Ok(())
}

struct FeatureRow {
    fid: i64,
    x: f64,
    y: f64,
    z: f64,
    attributes: String,
    remote_id: Option<String>,
}

impl FeatureRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fid: row.get(0)?,
            x: row.get(1)?,
            y: row.get(2)?,
            z: row.get(3)?,
            attributes: row.get(4)?,
            remote_id: row.get(5)?,
        })
    }

    fn into_feature(self) -> Result<LocalFeature, HostError> {
        let attributes: BTreeMap<String, AttributeValue> =
            serde_json::from_str(&self.attributes).map_err(store_err)?;
        let remote_id = self
            .remote_id
            .map(|id| id.parse::<RemoteId>())
            .transpose()
            .map_err(store_err)?;
        Ok(LocalFeature {
            local_id: Some(LocalId(self.fid)),
            remote_id,
            geometry: Point3::new(self.x, self.y, self.z),
            attributes,
        })
    }
}

struct LayerRow {
    id: String,
    name: String,
    geometry_type: String,
    srid: i32,
    attributes: String,
    parent_id: Option<String>,
}

impl LayerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            geometry_type: row.get(2)?,
            srid: row.get(3)?,
            attributes: row.get(4)?,
            parent_id: row.get(5)?,
        })
    }

    fn into_layer(self) -> Result<LayerInfo, HostError> {
        Ok(LayerInfo {
            id: self.id.parse().map_err(store_err)?,
            name: self.name,
            geometry_type: self.geometry_type,
            srid: self.srid,
            attributes: serde_json::from_str(&self.attributes).map_err(store_err)?,
            parent_id: self
                .parent_id
                .map(|id| id.parse::<LayerId>())
                .transpose()
                .map_err(store_err)?,
            temporary: false,
        })
    }
}

/// Read one feature of a layer
pub(crate) fn load_feature(
    conn: &Connection,
    layer: LayerId,
    id: LocalId,
) -> Result<Option<LocalFeature>, HostError> {
    let sql = format!(
        "SELECT {} FROM features WHERE fid = ?1 AND layer_id = ?2",
        FEATURE_COLUMNS
    );
    conn.query_row(&sql, params![id.0, layer.to_string()], FeatureRow::from_row)
        .optional()
        .map_err(store_err)?
        .map(FeatureRow::into_feature)
        .transpose()
}

/// Read one layer's record
pub(crate) fn load_layer(conn: &Connection, layer: LayerId) -> Result<Option<LayerInfo>, HostError> {
    let sql = format!("SELECT {} FROM layers WHERE id = ?1", LAYER_COLUMNS);
    conn.query_row(&sql, params![layer.to_string()], LayerRow::from_row)
        .optional()
        .map_err(store_err)?
        .map(LayerRow::into_layer)
        .transpose()
}

fn attributes_json(feature: &LocalFeature) -> Result<String, HostError> {
    serde_json::to_string(&feature.attributes).map_err(store_err)
}

/// A feature file implementing [`HostStore`]
pub struct SqliteHost {
    conn: Connection,
}

impl SqliteHost {
    /// Open or create the feature file
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: connect(path)?,
        })
    }

    /// Open an in-memory feature file (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Layers present in the file, sorted by name
    pub fn layers(&self) -> Result<Vec<LayerInfo>, HostError> {
        let sql = format!("SELECT {} FROM layers ORDER BY name", LAYER_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map([], LayerRow::from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().map(LayerRow::into_layer).collect()
    }

    pub fn layer(&self, id: LayerId) -> Result<Option<LayerInfo>, HostError> {
        load_layer(&self.conn, id)
    }

    /// Find a layer by id or by exact name
    pub fn find_layer(&self, name_or_id: &str) -> Result<Option<LayerInfo>, HostError> {
        if let Ok(id) = name_or_id.parse::<LayerId>() {
            return self.layer(id);
        }
        Ok(self.layers()?.into_iter().find(|l| l.name == name_or_id))
    }

    pub fn feature(&self, layer: LayerId, id: LocalId) -> Result<Option<LocalFeature>, HostError> {
        load_feature(&self.conn, layer, id)
    }

    pub fn find_by_remote(
        &self,
        layer: LayerId,
        remote: RemoteId,
    ) -> Result<Option<LocalFeature>, HostError> {
        let sql = format!(
            "SELECT {} FROM features WHERE remote_id = ?1 AND layer_id = ?2",
            FEATURE_COLUMNS
        );
        self.conn
            .query_row(&sql, params![remote.to_string(), layer.to_string()], FeatureRow::from_row)
            .optional()
            .map_err(store_err)?
            .map(FeatureRow::into_feature)
            .transpose()
    }

    fn require_layer(&self, layer: LayerId) -> Result<(), HostError> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM layers WHERE id = ?1")
            .and_then(|mut stmt| stmt.exists(params![layer.to_string()]))
            .map_err(store_err)?;
        if exists {
            Ok(())
        } else {
            Err(HostError::UnknownLayer(layer))
        }
    }

    fn insert_feature(&self, layer: LayerId, feature: &LocalFeature) -> Result<LocalId, HostError> {
        self.require_layer(layer)?;
        self.conn
            .execute(
                "INSERT INTO features (layer_id, x, y, z, attributes, remote_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    layer.to_string(),
                    feature.geometry.x,
                    feature.geometry.y,
                    feature.geometry.z,
                    attributes_json(feature)?,
                    feature.remote_id.map(|id| id.to_string()),
                ],
            )
            .map_err(store_err)?;
        Ok(LocalId(self.conn.last_insert_rowid()))
    }

    fn write_feature(&self, layer: LayerId, id: LocalId, feature: &LocalFeature) -> Result<(), HostError> {
        let changed = self
            .conn
            .execute(
                "UPDATE features SET x = ?1, y = ?2, z = ?3, attributes = ?4 \
                 WHERE fid = ?5 AND layer_id = ?6",
                params![
                    feature.geometry.x,
                    feature.geometry.y,
                    feature.geometry.z,
                    attributes_json(feature)?,
                    id.0,
                    layer.to_string(),
                ],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(HostError::UnknownFeature(id));
        }
        Ok(())
    }

    fn remove_feature(&self, layer: LayerId, id: LocalId) -> Result<(), HostError> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM features WHERE fid = ?1 AND layer_id = ?2",
                params![id.0, layer.to_string()],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(HostError::UnknownFeature(id));
        }
        Ok(())
    }

    // ==================== User edits ====================

    /// Add a point; the file assigns its id
    pub fn add_point(&self, layer: LayerId, feature: &LocalFeature) -> Result<LocalId, HostError> {
        let feature = LocalFeature {
            remote_id: None,
            ..feature.clone()
        };
        self.insert_feature(layer, &feature)
    }

    /// Edit a point in place and return its new state
    pub fn edit_point<F>(&self, layer: LayerId, id: LocalId, edit: F) -> Result<LocalFeature, HostError>
    where
        F: FnOnce(&mut LocalFeature),
    {
        let mut feature = self
            .feature(layer, id)?
            .ok_or(HostError::UnknownFeature(id))?;
        edit(&mut feature);
        self.write_feature(layer, id, &feature)?;
        Ok(feature)
    }

    pub fn delete_point(&self, layer: LayerId, id: LocalId) -> Result<(), HostError> {
        self.remove_feature(layer, id)
    }

    /// Replace a layer's attribute schema
    pub fn set_schema(&self, layer: LayerId, attributes: &[LayerAttribute]) -> Result<(), HostError> {
        let json = serde_json::to_string(attributes).map_err(store_err)?;
        let changed = self
            .conn
            .execute(
                "UPDATE layers SET attributes = ?1 WHERE id = ?2",
                params![json, layer.to_string()],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(HostError::UnknownLayer(layer));
        }
        Ok(())
    }

    /// Rename a layer if the file has it
    pub fn rename_layer(&self, layer: LayerId, name: &str) -> Result<bool, HostError> {
        let changed = self
            .conn
            .execute(
                "UPDATE layers SET name = ?1 WHERE id = ?2",
                params![name, layer.to_string()],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    /// Remove a layer and its features, without journaling the deletes
    pub fn remove_layer(&mut self, layer: LayerId) -> Result<bool, HostError> {
        let id = layer.to_string();
        let tx = self.conn.transaction().map_err(store_err)?;
        tx.execute("DELETE FROM features WHERE layer_id = ?1", params![id])
            .map_err(store_err)?;
        let removed = tx
            .execute("DELETE FROM layers WHERE id = ?1", params![id])
            .map_err(store_err)?;
        tx.execute("DELETE FROM feature_changes WHERE layer_id = ?1", params![id])
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(removed > 0)
    }

    pub fn feature_count(&self, layer: LayerId) -> Result<usize, HostError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM features WHERE layer_id = ?1",
                params![layer.to_string()],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(count as usize)
    }
}

impl HostStore for SqliteHost {
    fn open_layer(&mut self, layer: &LayerInfo) -> Result<(), HostError> {
        let attributes = serde_json::to_string(&layer.attributes).map_err(store_err)?;
        self.conn
            .execute(
                "INSERT INTO layers (id, name, geometry_type, srid, attributes, parent_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
                 geometry_type = excluded.geometry_type, srid = excluded.srid, \
                 attributes = excluded.attributes, parent_id = excluded.parent_id",
                params![
                    layer.id.to_string(),
                    layer.name,
                    layer.geometry_type,
                    layer.srid,
                    attributes,
                    layer.parent_id.map(|id| id.to_string()),
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn close_layer(&mut self, layer: LayerId) -> Result<(), HostError> {
        if self.remove_layer(layer)? {
            Ok(())
        } else {
            Err(HostError::UnknownLayer(layer))
        }
    }

    fn apply_feature(
        &mut self,
        layer: LayerId,
        mutation: HostMutation,
    ) -> Result<Option<LocalId>, HostError> {
        match mutation {
            HostMutation::Insert(feature) => self.insert_feature(layer, &feature).map(Some),
            HostMutation::Update(id, feature) => {
                self.write_feature(layer, id, &feature)?;
                if let Some(remote) = feature.remote_id {
                    self.tag_feature(layer, id, Some(remote))?;
                }
                Ok(None)
            }
            HostMutation::Delete(id) => {
                self.remove_feature(layer, id)?;
                Ok(None)
            }
        }
    }

    fn current_features(&self, layer: LayerId) -> Result<Vec<LocalFeature>, HostError> {
        self.require_layer(layer)?;
        let sql = format!(
            "SELECT {} FROM features WHERE layer_id = ?1 ORDER BY fid",
            FEATURE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params![layer.to_string()], FeatureRow::from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().map(FeatureRow::into_feature).collect()
    }

    fn tag_feature(
        &mut self,
        layer: LayerId,
        local: LocalId,
        remote: Option<RemoteId>,
    ) -> Result<(), HostError> {
        let changed = self
            .conn
            .execute(
                "UPDATE features SET remote_id = ?1 WHERE fid = ?2 AND layer_id = ?3",
                params![remote.map(|id| id.to_string()), local.0, layer.to_string()],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(HostError::UnknownFeature(local));
        }
        Ok(())
    }
}
