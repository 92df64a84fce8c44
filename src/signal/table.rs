// src/signal/table.rs
use std::ops::Range;
use ndarray::{s, Array2, ArrayView1, Axis};
use crate::error::ForceError;

/// Named columns over a shared row axis, one row per tick.
#[derive(Clone, Debug, PartialEq)]
pub struct DataTable {
    columns: Vec<String>,
    data: Array2<f64>,
}

impl Default for DataTable {
    fn default() -> Self {
        Self::with_rows(0)
    }
}

impl DataTable {
    pub fn with_rows(rows: usize) -> Self {
        Self {
            columns: Vec::new(),
            data: Array2::zeros((rows, 0)),
        }
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn push_column(&mut self, name: &str, values: &[f64]) -> Result<(), ForceError> {
        if values.len() != self.rows() {
            return Err(ForceError::Precondition(format!(
                "column {name} has {} rows, table has {}",
                values.len(),
                self.rows()
            )));
        }
        self.data
            .push_column(ArrayView1::from(values))
            .map_err(|e| ForceError::Precondition(format!("column {name}: {e}")))?;
        self.columns.push(name.to_owned());
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.data.column(index))
    }

    pub fn column_vec(&self, name: &str) -> Option<Vec<f64>> {
        self.column(name).map(|c| c.to_vec())
    }

    /// Same columns, every one transformed by `f`.
    pub fn map_columns(&self, f: impl Fn(&[f64]) -> Vec<f64>) -> Self {
        let mut data = self.data.clone();
        for mut column in data.axis_iter_mut(Axis(1)) {
            let mapped = f(&column.to_vec());
            column.iter_mut().zip(mapped).for_each(|(dst, v)| *dst = v);
        }
        Self {
            columns: self.columns.clone(),
            data,
        }
    }

    /// Rows `range`, all columns.
    pub fn slice_rows(&self, range: Range<usize>) -> Self {
        Self {
            columns: self.columns.clone(),
            data: self.data.slice(s![range, ..]).to_owned(),
        }
    }
}

/// Half-open row range for a window request.
///
/// `idx1 == idx2 == 0`, `idx2 <= idx1` and `idx2 > rows` all select the whole table.
pub fn window_range(rows: usize, idx1: usize, idx2: usize) -> Range<usize> {
    if (idx1 == 0 && idx2 == 0) || idx2 <= idx1 || idx2 > rows {
        0..rows
    } else {
        idx1..idx2
    }
}

/// A window of one table with its timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct TableWindow {
    pub timestamps: Vec<u64>,
    pub table: DataTable,
}

impl TableWindow {
    pub fn new(timestamps: &[u64], table: &DataTable, idx1: usize, idx2: usize) -> Self {
        let range = window_range(timestamps.len().min(table.rows()), idx1, idx2);
        Self {
            timestamps: timestamps[range.clone()].to_vec(),
            table: table.slice_rows(range),
        }
    }

    pub fn rows(&self) -> usize {
        self.timestamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> DataTable {
        let mut t = DataTable::with_rows(4);
        t.push_column("a", &[1.0, 2.0, 3.0, 4.0]).unwrap();
        t.push_column("b", &[10.0, 20.0, 30.0, 40.0]).unwrap();
        t
    }

    #[test]
    fn columns_keep_insertion_order() {
        let t = table();
        assert_eq!(t.columns(), &["a".to_owned(), "b".to_owned()]);
        assert_eq!(t.column_vec("b").unwrap(), vec![10.0, 20.0, 30.0, 40.0]);
        assert!(t.column("c").is_none());
        let mut t = t;
        assert!(t.push_column("short", &[1.0]).is_err());
    }

    #[test]
    fn window_falls_back_to_full_table() {
        assert_eq!(window_range(10, 0, 0), 0..10);
        assert_eq!(window_range(10, 5, 5), 0..10);
        assert_eq!(window_range(10, 6, 2), 0..10);
        assert_eq!(window_range(10, 2, 11), 0..10);
        assert_eq!(window_range(10, 2, 10), 2..10);
        assert_eq!(window_range(10, 0, 3), 0..3);
    }

    #[test]
    fn window_slices_rows_and_timestamps() {
        let window = TableWindow::new(&[100, 110, 120, 130], &table(), 1, 3);
        assert_eq!(window.timestamps, vec![110, 120]);
        assert_eq!(window.table.column_vec("a").unwrap(), vec![2.0, 3.0]);
        let full = TableWindow::new(&[100, 110, 120, 130], &table(), 0, 0);
        assert_eq!(full.rows(), 4);
        assert_eq!(full.table, table());
    }

    #[test]
    fn map_columns_is_per_column() {
        let doubled = table().map_columns(|c| c.iter().map(|v| v * 2.0).collect());
        assert_eq!(doubled.column_vec("a").unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(doubled.columns(), table().columns());
    }
}
