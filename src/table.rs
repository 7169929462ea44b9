//! Minimal columnar table used as resolver input and output.
//!
//! Cells are optional strings; typing and file formats belong to the
//! pipeline that builds the table.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A named column of nullable string cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    name: String,
    values: Vec<Option<String>>,
}

impl Column {
    /// Creates a column from owned cells.
    #[must_use]
    pub fn new(name: impl Into<String>, values: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Builds a column from borrowed cells.
    #[must_use]
    pub fn from_strs(name: impl Into<String>, values: &[Option<&str>]) -> Self {
        Self::new(name, values.iter().map(|v| v.map(str::to_string)).collect())
    }

    /// Column name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cell at `row`; `None` for null cells and out-of-range rows.
    #[must_use]
    pub fn get(&self, row: usize) -> Option<&str> {
        self.values.get(row).and_then(Option::as_deref)
    }

    /// All cells, nulls included.
    #[must_use]
    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the column has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Columns of equal length, in insertion order.
///
/// # Examples
///
/// ```
/// use company_id_resolver::Table;
///
/// let table = Table::from_rows(
///     &["plan_code", "customer_name"],
///     &[vec![Some("FP0001"), Some("公司A")], vec![None, Some("公司B")]],
/// )
/// .unwrap();
/// assert_eq!(table.len(), 2);
/// assert_eq!(table.value("customer_name", 1), Some("公司B"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
    rows: usize,
}

impl Table {
    /// Builds a table, checking that all columns have the same length.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ColumnLengthMismatch` on ragged input.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self, ValidationError> {
        let rows = columns.first().map_or(0, Column::len);
        for column in &columns {
            if column.len() != rows {
                return Err(ValidationError::ColumnLengthMismatch {
                    column: column.name.clone(),
                    expected: rows,
                    actual: column.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    /// Builds a table from row-major cells.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ColumnLengthMismatch` if a row has the
    /// wrong number of cells.
    pub fn from_rows(headers: &[&str], rows: &[Vec<Option<&str>>]) -> Result<Self, ValidationError> {
        let mut columns: Vec<Column> = headers
            .iter()
            .map(|h| Column::new(*h, Vec::with_capacity(rows.len())))
            .collect();

        for row in rows {
            if row.len() != headers.len() {
                return Err(ValidationError::ColumnLengthMismatch {
                    column: "<row>".to_string(),
                    expected: headers.len(),
                    actual: row.len(),
                });
            }
            for (column, cell) in columns.iter_mut().zip(row) {
                column.values.push(cell.map(str::to_string));
            }
        }

        Ok(Self {
            columns,
            rows: rows.len(),
        })
    }

    /// Appends or replaces a column, builder style.
    ///
    /// # Errors
    ///
    /// See `set_column`.
    pub fn with_column(mut self, column: Column) -> Result<Self, ValidationError> {
        self.set_column(column)?;
        Ok(self)
    }

    /// Replaces the column with the same name, or appends it.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ColumnLengthMismatch` if the length differs
    /// from the table's row count (an empty table adopts the new length).
    pub fn set_column(&mut self, column: Column) -> Result<(), ValidationError> {
        if self.columns.is_empty() {
            self.rows = column.len();
        } else if column.len() != self.rows {
            return Err(ValidationError::ColumnLengthMismatch {
                column: column.name,
                expected: self.rows,
                actual: column.values.len(),
            });
        }

        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(())
    }

    /// Column by exact name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// True if a column named `name` exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Cell lookup by column name and row.
    #[must_use]
    pub fn value(&self, column: &str, row: usize) -> Option<&str> {
        self.column(column).and_then(|c| c.get(row))
    }

    /// Column names in insertion order.
    #[must_use]
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(Column::name)
    }

    /// Number of rows.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.rows
    }

    /// True if the table has no rows.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ragged_columns_are_rejected() {
        let err = Table::from_columns(vec![
            Column::from_strs("a", &[Some("1"), Some("2")]),
            Column::from_strs("b", &[Some("1")]),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ColumnLengthMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn set_column_replaces_in_place() {
        let mut table = Table::from_rows(&["a", "out"], &[vec![Some("1"), Some("old")]]).unwrap();
        table.set_column(Column::from_strs("out", &[Some("new")])).unwrap();

        assert_eq!(table.column_names().collect::<Vec<_>>(), vec!["a", "out"]);
        assert_eq!(table.value("out", 0), Some("new"));
    }

    #[test]
    fn set_column_checks_length() {
        let mut table = Table::from_rows(&["a"], &[vec![Some("1")]]).unwrap();
        assert!(table.set_column(Column::from_strs("b", &[None, None])).is_err());
    }

    #[test]
    fn null_and_out_of_range_cells_are_none() {
        let table = Table::from_rows(&["a"], &[vec![None]]).unwrap();
        assert_eq!(table.value("a", 0), None);
        assert_eq!(table.value("a", 5), None);
        assert_eq!(table.value("missing", 0), None);
    }
}
