//! Schema model and the versioned catalog.
//!
//! The engine consumes resolved schemas only; DDL parsing happens upstream.
//! Schema versions are appended with a creation timestamp and never mutated,
//! so a snapshot read resolves the schema that was active at its timestamp.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use meridian_common::datum::{DataType, Datum};
use meridian_common::error::{Error, Result};
use meridian_common::key::{Key, SortOrder};
use meridian_common::types::{TableId, Timestamp};

/// Column definition in a table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

/// One component of a table's primary key: a column position plus direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyPart {
    pub column: usize,
    pub order: SortOrder,
}

impl KeyPart {
    pub fn asc(column: usize) -> Self {
        KeyPart {
            column,
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(column: usize) -> Self {
        KeyPart {
            column,
            order: SortOrder::Descending,
        }
    }
}

/// One declared key column of a secondary index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexColumn {
    pub column: String,
    pub order: SortOrder,
}

impl IndexColumn {
    pub fn asc(column: impl Into<String>) -> Self {
        IndexColumn {
            column: column.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        IndexColumn {
            column: column.into(),
            order: SortOrder::Descending,
        }
    }
}

/// A secondary index over one base table. The index's entries live in their
/// own storage table (`data_table`); an entry's key is the declared key
/// columns followed by the base primary key, which is the entry's record
/// identity even for unique indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub data_table: TableId,
    pub key_columns: Vec<IndexColumn>,
    pub null_filtered: bool,
    pub unique: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_columns: Vec<IndexColumn>) -> Self {
        IndexSchema {
            name: name.into(),
            data_table: TableId(0),
            key_columns,
            null_filtered: false,
            unique: false,
        }
    }

    pub fn null_filtered(mut self) -> Self {
        self.null_filtered = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Number of declared key columns, excluding the base primary-key tail.
    pub fn key_len(&self) -> usize {
        self.key_columns.len()
    }
}

/// Table schema metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<KeyPart>,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>, primary_key: Vec<KeyPart>) -> Self {
        TableSchema {
            id: TableId(0),
            name: name.into(),
            columns,
            primary_key,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Find a column position by name (case-insensitive).
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn pk_positions(&self) -> Vec<usize> {
        self.primary_key.iter().map(|p| p.column).collect()
    }

    pub fn pk_orders(&self) -> Vec<SortOrder> {
        self.primary_key.iter().map(|p| p.order).collect()
    }

    pub fn pk_types(&self) -> Vec<DataType> {
        self.primary_key
            .iter()
            .map(|p| self.columns[p.column].data_type.clone())
            .collect()
    }

    /// Extract the primary key values from a full row.
    pub fn extract_pk(&self, row: &[Datum]) -> Key {
        Key::new(
            self.primary_key
                .iter()
                .map(|p| row.get(p.column).cloned().unwrap_or(Datum::Null))
                .collect(),
        )
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }
}

/// One schema version: the full set of tables (and their indexes) active
/// from its creation timestamp onward.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Schema {
    tables: HashMap<String, TableSchema>,
}

impl Schema {
    /// Build and validate a schema from its table definitions. Table and
    /// index storage ids must already be assigned and unique.
    pub fn from_tables(tables: Vec<TableSchema>) -> Result<Schema> {
        let mut map = HashMap::with_capacity(tables.len());
        let mut ids = HashSet::new();
        for table in tables {
            validate_table(&table)?;
            if !ids.insert(table.id) {
                return Err(Error::invalid_argument(format!(
                    "duplicate storage id for table {}",
                    table.name
                )));
            }
            for index in &table.indexes {
                if !ids.insert(index.data_table) {
                    return Err(Error::invalid_argument(format!(
                        "duplicate storage id for index {}",
                        index.name
                    )));
                }
            }
            let key = table.name.to_ascii_lowercase();
            if map.insert(key, table).is_some() {
                return Err(Error::invalid_argument("duplicate table name"));
            }
        }
        Ok(Schema { tables: map })
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    pub fn table_by_id(&self, id: TableId) -> Option<&TableSchema> {
        self.tables.values().find(|t| t.id == id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

fn validate_table(table: &TableSchema) -> Result<()> {
    if table.primary_key.is_empty() {
        return Err(Error::invalid_argument(format!(
            "table {} has no primary key",
            table.name
        )));
    }
    let mut names = HashSet::new();
    for col in &table.columns {
        if !names.insert(col.name.to_ascii_lowercase()) {
            return Err(Error::invalid_argument(format!(
                "table {} has duplicate column {}",
                table.name, col.name
            )));
        }
    }
    for part in &table.primary_key {
        let col = table.columns.get(part.column).ok_or_else(|| {
            Error::invalid_argument(format!(
                "table {} primary key references missing column {}",
                table.name, part.column
            ))
        })?;
        if matches!(col.data_type, DataType::Array(_)) {
            return Err(Error::invalid_argument(format!(
                "column {} of type {} cannot be a key column",
                col.name, col.data_type
            )));
        }
    }
    let mut index_names = HashSet::new();
    for index in &table.indexes {
        if !index_names.insert(index.name.to_ascii_lowercase()) {
            return Err(Error::invalid_argument(format!(
                "table {} has duplicate index {}",
                table.name, index.name
            )));
        }
        if index.key_columns.is_empty() {
            return Err(Error::invalid_argument(format!(
                "index {} has no key columns",
                index.name
            )));
        }
        for key_col in &index.key_columns {
            let pos = table.find_column(&key_col.column).ok_or_else(|| {
                Error::invalid_argument(format!(
                    "index {} references unknown column {}",
                    index.name, key_col.column
                ))
            })?;
            if matches!(table.columns[pos].data_type, DataType::Array(_)) {
                return Err(Error::invalid_argument(format!(
                    "column {} of type {} cannot be a key column",
                    key_col.column, table.columns[pos].data_type
                )));
            }
        }
    }
    Ok(())
}

/// Append-only log of schema versions keyed by creation timestamp.
#[derive(Debug, Default)]
pub struct VersionedCatalog {
    versions: RwLock<BTreeMap<Timestamp, Arc<Schema>>>,
}

impl VersionedCatalog {
    pub fn new() -> Self {
        VersionedCatalog::default()
    }

    pub fn install(&self, creation_ts: Timestamp, schema: Arc<Schema>) {
        let mut versions = self.versions.write();
        versions.insert(creation_ts, schema);
    }

    /// The schema active at `ts`: largest creation timestamp `<= ts`.
    pub fn schema_at(&self, ts: Timestamp) -> Option<Arc<Schema>> {
        let versions = self.versions.read();
        versions.range(..=ts).next_back().map(|(_, s)| s.clone())
    }

    pub fn latest(&self) -> Option<(Timestamp, Arc<Schema>)> {
        let versions = self.versions.read();
        versions.iter().next_back().map(|(t, s)| (*t, s.clone()))
    }

    pub fn version_count(&self) -> usize {
        self.versions.read().len()
    }
}
