use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// An append-only schema change applied to every stored row of a table.
///
/// Migrations are identified by `version` and run at most once per table.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: &'static str,
    pub apply: fn(&mut Map<String, Value>),
}

/// A row type that can live in a [`super::Dao`].
pub trait Persistable: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;

    fn primary_key(&self) -> String;

    /// String form of a column value, used by `delete_where`.
    fn column(&self, name: &str) -> Option<String>;

    fn migrations() -> &'static [Migration] {
        &[]
    }
}

/// Inserts `column` with `default` into rows that predate it.
pub fn add_column(row: &mut Map<String, Value>, column: &str, default: Value) {
    row.entry(column.to_string()).or_insert(default);
}
