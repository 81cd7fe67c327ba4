//! Index projection: deriving index entries from base rows.
//!
//! An index entry's key is the declared key columns followed by the base
//! primary key; the PK tail is the entry's record identity. The entry row
//! stores exactly those values, so an index read never touches base storage.

use meridian_common::datum::{DataType, Datum};
use meridian_common::error::{Error, Result};
use meridian_common::key::{Key, SortOrder};
use meridian_common::types::TableId;

use crate::catalog::{IndexSchema, TableSchema};
use crate::encoding::encode_key;
use crate::store::RowData;

/// A projected index entry.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub key: Key,
    pub key_bytes: Vec<u8>,
    pub row: RowData,
}

/// Resolved projection plan for one `(table, index)` pair. Pure: projecting
/// never consults storage.
#[derive(Debug, Clone)]
pub struct IndexProjector {
    pub index_name: String,
    pub data_table: TableId,
    pub unique: bool,
    pub null_filtered: bool,
    /// Declared key column count, excluding the PK tail.
    pub key_len: usize,
    /// Base-row positions of the declared key columns.
    key_positions: Vec<usize>,
    /// Base-row positions of the primary-key tail.
    pk_positions: Vec<usize>,
    /// Sort direction per entry key component (declared columns + PK tail).
    orders: Vec<SortOrder>,
}

impl IndexProjector {
    pub fn new(table: &TableSchema, index: &IndexSchema) -> Result<IndexProjector> {
        let mut key_positions = Vec::with_capacity(index.key_columns.len());
        let mut orders = Vec::with_capacity(index.key_columns.len() + table.primary_key.len());
        for key_col in &index.key_columns {
            let pos = table.find_column(&key_col.column).ok_or_else(|| {
                Error::invalid_argument(format!(
                    "index {} references unknown column {}",
                    index.name, key_col.column
                ))
            })?;
            key_positions.push(pos);
            orders.push(key_col.order);
        }
        orders.extend(table.pk_orders());
        Ok(IndexProjector {
            index_name: index.name.clone(),
            data_table: index.data_table,
            unique: index.unique,
            null_filtered: index.null_filtered,
            key_len: index.key_columns.len(),
            key_positions,
            pk_positions: table.pk_positions(),
            orders,
        })
    }

    /// Project a base row into its index entry. `None` means the row is
    /// filtered out (null-filtered index with a NULL key column).
    pub fn project(&self, row: &RowData) -> Option<IndexEntry> {
        let mut datums: Vec<Datum> = Vec::with_capacity(self.orders.len());
        for &pos in &self.key_positions {
            datums.push(row.get(pos).cloned().unwrap_or(Datum::Null));
        }
        if self.null_filtered && datums.iter().any(|d| d.is_null()) {
            return None;
        }
        for &pos in &self.pk_positions {
            datums.push(row.get(pos).cloned().unwrap_or(Datum::Null));
        }
        let key = Key::new(datums);
        let key_bytes = encode_key(&key, &self.orders);
        let row = key.datums().to_vec();
        Some(IndexEntry {
            key,
            key_bytes,
            row,
        })
    }

    /// Encoded bytes of an entry's key prefix (declared columns only). A
    /// byte-prefix of the full entry key, usable as a scan lower bound.
    pub fn prefix_bytes(&self, entry_key: &Key) -> Vec<u8> {
        let prefix = Key::new(entry_key.datums()[..self.key_len].to_vec());
        encode_key(&prefix, &self.orders[..self.key_len])
    }

    /// Whether two entry keys collide on the declared key prefix. NULL equals
    /// NULL here.
    pub fn prefixes_collide(&self, a: &Key, b: &Key) -> bool {
        a.datums()[..self.key_len]
            .iter()
            .zip(b.datums()[..self.key_len].iter())
            .all(|(x, y)| x.index_eq(y))
    }

    pub fn orders(&self) -> &[SortOrder] {
        &self.orders
    }
}

/// Column names readable from an index entry: the declared key columns, then
/// the base table's primary-key columns.
pub fn entry_columns(table: &TableSchema, index: &IndexSchema) -> Vec<String> {
    let mut names: Vec<String> = index.key_columns.iter().map(|c| c.column.clone()).collect();
    for part in &table.primary_key {
        names.push(table.columns[part.column].name.clone());
    }
    names
}

/// Column types of an index entry row, aligned with [`entry_columns`].
pub fn entry_types(table: &TableSchema, index: &IndexSchema) -> Result<Vec<DataType>> {
    let mut types = Vec::with_capacity(index.key_columns.len() + table.primary_key.len());
    for key_col in &index.key_columns {
        let pos = table.find_column(&key_col.column).ok_or_else(|| {
            Error::invalid_argument(format!(
                "index {} references unknown column {}",
                index.name, key_col.column
            ))
        })?;
        types.push(table.columns[pos].data_type.clone());
    }
    types.extend(table.pk_types());
    Ok(types)
}
