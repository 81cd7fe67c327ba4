//! Lazy row cursors returned by reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meridian_common::datum::Datum;
use meridian_common::error::{Error, Result};

/// A single-pass, forward-only stream of projected rows. Finite, not
/// restartable. Cancellation is observed at advance boundaries.
#[derive(Debug)]
pub struct RowCursor {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<Datum>>,
    cancel: Arc<AtomicBool>,
}

impl RowCursor {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Datum>>, cancel: Arc<AtomicBool>) -> Self {
        RowCursor {
            columns,
            rows: rows.into_iter(),
            cancel,
        }
    }

    /// Names of the projected columns, in output order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Drain the cursor, propagating the first error.
    pub fn collect_rows(self) -> Result<Vec<Vec<Datum>>> {
        let mut out = Vec::new();
        for row in self {
            out.push(row?);
        }
        Ok(out)
    }
}

impl Iterator for RowCursor {
    type Item = Result<Vec<Datum>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.load(Ordering::Acquire) {
            return Some(Err(Error::cancelled("read cancelled")));
        }
        self.rows.next().map(Ok)
    }
}
