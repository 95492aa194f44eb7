use super::database::Database;
use super::error::StorageError;
use super::persistable::Persistable;
use sled::Transactional;
use sled::transaction::ConflictableTransactionError;
use std::marker::PhantomData;
use tracing::warn;

/// Typed access to one persisted table.
///
/// Rows are kept in insertion order (a monotonically increasing sequence
/// number is the physical key); the primary key is resolved through a
/// secondary index tree. Updates keep the original position.
pub struct Dao<T: Persistable> {
    db: Database,
    rows: sled::Tree,
    index: sled::Tree,
    _row: PhantomData<fn() -> T>,
}

impl<T: Persistable> Clone for Dao<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            rows: self.rows.clone(),
            index: self.index.clone(),
            _row: PhantomData,
        }
    }
}

impl<T: Persistable> std::fmt::Debug for Dao<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dao").field("table", &T::TABLE).finish()
    }
}

impl<T: Persistable> Dao<T> {
    pub(crate) fn new(db: Database, rows: sled::Tree, index: sled::Tree) -> Self {
        Self {
            db,
            rows,
            index,
            _row: PhantomData,
        }
    }

    pub fn insert(&self, row: &T) -> Result<(), StorageError> {
        let key = row.primary_key();
        let encoded = serde_json::to_vec(row)?;

        self.db.write(|| {
            if self.index.contains_key(key.as_bytes())? {
                return Err(StorageError::DuplicateKey {
                    table: T::TABLE,
                    key,
                });
            }
            let sequence = self.db.next_sequence()?.to_be_bytes();

            (&self.rows, &self.index)
                .transaction(|(rows, index)| {
                    rows.insert(&sequence[..], encoded.as_slice())?;
                    index.insert(key.as_bytes(), &sequence[..])?;
                    Ok::<_, ConflictableTransactionError<()>>(())
                })
                .map_err(|e| StorageError::from_transaction(T::TABLE, e))
        })
    }

    pub fn update(&self, row: &T) -> Result<(), StorageError> {
        let key = row.primary_key();
        let encoded = serde_json::to_vec(row)?;

        self.db.write(|| {
            let Some(sequence) = self.index.get(key.as_bytes())? else {
                return Err(StorageError::NotFound {
                    table: T::TABLE,
                    key,
                });
            };
            self.rows.insert(sequence, encoded)?;
            Ok(())
        })
    }

    pub fn fetch_all(&self) -> Result<Vec<T>, StorageError> {
        self.fetch_first(usize::MAX)
    }

    /// Oldest `n` rows in insertion order.
    pub fn fetch_first(&self, n: usize) -> Result<Vec<T>, StorageError> {
        self.db.read(|| {
            let mut out = Vec::new();
            for entry in self.rows.iter() {
                if out.len() >= n {
                    break;
                }
                let (_, value) = entry?;
                if let Some(row) = decode::<T>(&value) {
                    out.push(row);
                }
            }
            Ok(out)
        })
    }

    pub fn fetch_one(&self, key: &str) -> Result<Option<T>, StorageError> {
        self.db.read(|| {
            let Some(sequence) = self.index.get(key.as_bytes())? else {
                return Ok(None);
            };
            Ok(self.rows.get(sequence)?.and_then(|value| decode::<T>(&value)))
        })
    }

    pub fn delete_all(&self) -> Result<Vec<T>, StorageError> {
        self.db.write(|| {
            let mut removed = Vec::new();
            for entry in self.rows.iter() {
                let (_, value) = entry?;
                if let Some(row) = decode::<T>(&value) {
                    removed.push(row);
                }
            }
            self.rows.clear()?;
            self.index.clear()?;
            Ok(removed)
        })
    }

    pub fn delete_one(&self, key: &str) -> Result<Option<T>, StorageError> {
        self.db.write(|| self.remove_locked(key))
    }

    /// Deletes every row whose primary key is listed. Missing keys are skipped.
    pub fn delete_many(&self, keys: &[String]) -> Result<Vec<T>, StorageError> {
        self.db.write(|| {
            let mut removed = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(row) = self.remove_locked(key)? {
                    removed.push(row);
                }
            }
            Ok(removed)
        })
    }

    /// Deletes the oldest rows whose `column` equals `value`. A `limit` of 0
    /// removes every match.
    pub fn delete_where(
        &self,
        column: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<T>, StorageError> {
        let limit = if limit == 0 { usize::MAX } else { limit };

        self.db.write(|| {
            let mut matches = Vec::new();
            for entry in self.rows.iter() {
                if matches.len() >= limit {
                    break;
                }
                let (_, encoded) = entry?;
                let Some(row) = decode::<T>(&encoded) else {
                    continue;
                };
                if row.column(column).as_deref() == Some(value) {
                    matches.push(row.primary_key());
                }
            }

            let mut removed = Vec::with_capacity(matches.len());
            for key in &matches {
                if let Some(row) = self.remove_locked(key)? {
                    removed.push(row);
                }
            }
            Ok(removed)
        })
    }

    pub fn len(&self) -> usize {
        self.db.read(|| self.rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Caller must hold the write barrier.
    fn remove_locked(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(sequence) = self.index.get(key.as_bytes())? else {
            return Ok(None);
        };

        let removed = (&self.rows, &self.index)
            .transaction(|(rows, index)| {
                let removed = rows.remove(sequence.clone())?;
                index.remove(key.as_bytes())?;
                Ok::<_, ConflictableTransactionError<()>>(removed)
            })
            .map_err(|e| StorageError::from_transaction(T::TABLE, e))?;

        Ok(removed.and_then(|value| decode::<T>(&value)))
    }
}

fn decode<T: Persistable>(value: &[u8]) -> Option<T> {
    match serde_json::from_slice(value) {
        Ok(row) => Some(row),
        Err(e) => {
            warn!("Skipping undecodable row in {}: {}", T::TABLE, e);
            None
        }
    }
}
