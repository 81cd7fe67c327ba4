//! Resolution of read requests against a schema snapshot.

use meridian_common::datum::DataType;
use meridian_common::error::{Error, Result};
use meridian_common::key::{KeySet, SortOrder};
use meridian_common::types::TableId;
use meridian_storage::catalog::Schema;
use meridian_storage::index::{entry_columns, entry_types};

/// A read request: table, columns, a key set, and optionally an index to
/// read through. With an index the key set addresses index keys and results
/// follow the index's declared order; without one they address primary keys
/// and results are in primary-key order.
#[derive(Debug, Clone)]
pub struct ReadArg {
    pub table: String,
    pub index: Option<String>,
    pub columns: Vec<String>,
    pub key_set: KeySet,
}

impl ReadArg {
    pub fn new(table: impl Into<String>, columns: Vec<String>, key_set: KeySet) -> Self {
        ReadArg {
            table: table.into(),
            index: None,
            columns,
            key_set,
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }
}

/// A read request resolved against a schema snapshot.
#[derive(Debug)]
pub(crate) struct ResolvedRead {
    /// Storage table scanned: the base table, or the index's data table.
    pub storage_table: TableId,
    /// Key layout of the scanned table, for key-set canonicalization.
    pub key_types: Vec<DataType>,
    pub key_orders: Vec<SortOrder>,
    /// Positions of the requested columns within the stored row.
    pub positions: Vec<usize>,
    /// Output column names, echoing the request.
    pub columns: Vec<String>,
}

pub(crate) fn resolve_read(schema: &Schema, arg: &ReadArg) -> Result<ResolvedRead> {
    let table = schema
        .table(&arg.table)
        .ok_or_else(|| Error::not_found(format!("table not found: {}", arg.table)))?;

    match &arg.index {
        None => {
            let mut positions = Vec::with_capacity(arg.columns.len());
            for col in &arg.columns {
                let pos = table.find_column(col).ok_or_else(|| {
                    Error::not_found(format!("column not found in table {}: {}", table.name, col))
                })?;
                positions.push(pos);
            }
            Ok(ResolvedRead {
                storage_table: table.id,
                key_types: table.pk_types(),
                key_orders: table.pk_orders(),
                positions,
                columns: arg.columns.clone(),
            })
        }
        Some(index_name) => {
            let index = table.find_index(index_name).ok_or_else(|| {
                Error::not_found(format!(
                    "index not found on table {}: {}",
                    table.name, index_name
                ))
            })?;
            let names = entry_columns(table, index);
            let mut positions = Vec::with_capacity(arg.columns.len());
            for col in &arg.columns {
                let pos = names
                    .iter()
                    .position(|n| n.eq_ignore_ascii_case(col))
                    .ok_or_else(|| {
                        Error::invalid_argument(format!(
                            "column {} cannot be read through index {}",
                            col, index.name
                        ))
                    })?;
                positions.push(pos);
            }
            let mut key_orders: Vec<SortOrder> =
                index.key_columns.iter().map(|c| c.order).collect();
            key_orders.extend(table.pk_orders());
            Ok(ResolvedRead {
                storage_table: index.data_table,
                key_types: entry_types(table, index)?,
                key_orders,
                positions,
                columns: arg.columns.clone(),
            })
        }
    }
}
