//! Dense, named-column numeric tables.

use serde::{Deserialize, Serialize};

use crate::errors::{CatalogError, SgResult};

/// A dense row-major matrix of `f64` values with named columns.
///
/// Every dataset produced by a generator is wrapped in a `Table` before it
/// is persisted or handed to training code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: usize,
    values: Vec<f64>,
}

impl Table {
    /// Wrap row-major `values` with the given column names.
    pub fn new(columns: Vec<String>, values: Vec<f64>) -> SgResult<Self> {
        let width = columns.len();
        if width == 0 {
            if !values.is_empty() {
                return Err(CatalogError::ShapeMismatch {
                    expected: "0 values for a table without columns".to_string(),
                    actual: format!("{} values", values.len()),
                }
                .into());
            }
            return Ok(Self { columns, rows: 0, values });
        }

        if values.len() % width != 0 {
            return Err(CatalogError::ShapeMismatch {
                expected: format!("a multiple of {width} values"),
                actual: format!("{} values", values.len()),
            }
            .into());
        }

        Ok(Self {
            rows: values.len() / width,
            columns,
            values,
        })
    }

    /// A table of `rows` rows with every value set to NaN.
    pub fn nan(columns: Vec<String>, rows: usize) -> Self {
        let values = vec![f64::NAN; rows * columns.len()];
        Self { columns, rows, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Raw row-major storage.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        if index >= self.rows {
            return None;
        }
        let width = self.width();
        Some(&self.values[index * width..(index + 1) * width])
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Copy out a single column by name.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        let width = self.width();
        Some((0..self.rows).map(|r| self.values[r * width + idx]).collect())
    }

    /// Value at (`row`, `column`).
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let idx = self.column_index(column)?;
        self.row(row).map(|r| r[idx])
    }

    /// Keep at most the first `rows` rows.
    pub fn truncate(&mut self, rows: usize) {
        if rows < self.rows {
            self.rows = rows;
            self.values.truncate(rows * self.columns.len());
        }
    }

    /// True for every row whose values are all finite.
    pub fn finite_rows(&self) -> Vec<bool> {
        let width = self.width();
        if width == 0 {
            return vec![true; self.rows];
        }
        self.values
            .chunks(width)
            .map(|row| row.iter().all(|v| v.is_finite()))
            .collect()
    }

    /// Keep only the rows where `mask` is true.
    pub fn retain_rows(&mut self, mask: &[bool]) -> SgResult<()> {
        if mask.len() != self.rows {
            return Err(CatalogError::ShapeMismatch {
                expected: format!("{} mask entries", self.rows),
                actual: format!("{} mask entries", mask.len()),
            }
            .into());
        }

        let width = self.width();
        let mut kept = Vec::with_capacity(self.values.len());
        for (row, keep) in self.values.chunks(width.max(1)).zip(mask) {
            if *keep {
                kept.extend_from_slice(row);
            }
        }
        self.rows = mask.iter().filter(|k| **k).count();
        self.values = kept;
        Ok(())
    }

    /// Build a new table from the named columns, in the given order.
    pub fn select(&self, names: &[String]) -> SgResult<Table> {
        let indices = names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| CatalogError::UnknownColumn {
                    column: name.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let width = self.width();
        let mut values = Vec::with_capacity(self.rows * indices.len());
        for r in 0..self.rows {
            let row = &self.values[r * width..(r + 1) * width];
            values.extend(indices.iter().map(|&i| row[i]));
        }

        Ok(Table {
            columns: names.to_vec(),
            rows: self.rows,
            values,
        })
    }
}
