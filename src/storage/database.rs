use super::dao::Dao;
use super::error::StorageError;
use super::persistable::Persistable;
use parking_lot::RwLock;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MIGRATIONS_TREE: &str = "__migrations";
const META_TREE: &str = "__meta";

/// Durable row store shared by every persisted table.
///
/// Reads run concurrently; inserts, updates and deletes take an exclusive
/// barrier so multi-step mutations (scan then delete) never interleave.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

struct Inner {
    db: sled::Db,
    barrier: RwLock<()>,
    migrations: sled::Tree,
    meta: sled::Tree,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("was_recovered", &self.inner.db.was_recovered())
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        info!(
            "Opened event store at {} (recovered: {})",
            path.display(),
            db.was_recovered()
        );
        Self::from_db(db)
    }

    /// In-memory store removed on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let migrations = db.open_tree(MIGRATIONS_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                barrier: RwLock::new(()),
                migrations,
                meta,
            }),
        })
    }

    /// Opens the table for `T` and applies its pending migrations.
    pub fn create_table<T: Persistable>(&self) -> Result<Dao<T>, StorageError> {
        let rows = self.inner.db.open_tree(T::TABLE)?;
        let index = self.inner.db.open_tree(format!("{}.index", T::TABLE))?;

        self.write(|| -> Result<(), StorageError> {
            for migration in T::migrations() {
                let marker = format!("{}/{}", T::TABLE, migration.version);
                if self.inner.migrations.contains_key(marker.as_bytes())? {
                    continue;
                }

                let mut migrated = 0usize;
                for entry in rows.iter() {
                    let (key, value) = entry?;
                    let mut row: Value = match serde_json::from_slice(&value) {
                        Ok(row) => row,
                        Err(e) => {
                            warn!("Skipping undecodable row in {} during migration: {}", T::TABLE, e);
                            continue;
                        }
                    };
                    if let Value::Object(map) = &mut row {
                        (migration.apply)(map);
                        rows.insert(key, serde_json::to_vec(&row)?)?;
                        migrated += 1;
                    }
                }

                self.inner
                    .migrations
                    .insert(marker.as_bytes(), chrono::Utc::now().to_rfc3339().as_bytes())?;
                info!(
                    "Applied migration {} to {} ({} rows)",
                    migration.version,
                    T::TABLE,
                    migrated
                );
            }
            Ok(())
        })?;

        debug!("Table {} ready ({} rows)", T::TABLE, rows.len());
        Ok(Dao::new(self.clone(), rows, index))
    }

    /// Migration versions already applied to `table`, sorted by version.
    pub fn applied_migrations(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{table}/");
        self.read(|| {
            self.inner
                .migrations
                .scan_prefix(prefix.as_bytes())
                .keys()
                .map(|key| {
                    key.map(|k| String::from_utf8_lossy(&k[prefix.len()..]).into_owned())
                        .map_err(StorageError::from)
                })
                .collect()
        })
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<u64>, StorageError> {
        self.read(|| {
            Ok(self.inner.meta.get(key.as_bytes())?.and_then(|value| {
                let bytes: [u8; 8] = value.as_ref().try_into().ok()?;
                Some(u64::from_be_bytes(bytes))
            }))
        })
    }

    pub fn meta_put(&self, key: &str, value: u64) -> Result<(), StorageError> {
        self.write(|| {
            self.inner.meta.insert(key.as_bytes(), value.to_be_bytes().to_vec())?;
            Ok(())
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub(crate) fn next_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.inner.db.generate_id()?)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce() -> R) -> R {
        let _shared = self.inner.barrier.read();
        f()
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce() -> R) -> R {
        let _exclusive = self.inner.barrier.write();
        f()
    }

    #[cfg(test)]
    pub(crate) fn inner_tree_for_test(&self, name: &str) -> sled::Tree {
        self.inner.db.open_tree(name).unwrap()
    }
}
