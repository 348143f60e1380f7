//! Raw input frame handed to the pipeline, converted from a polars
//! `DataFrame` into row-id indexed columns.

use crate::error::{PrepError, Result};
use polars::prelude::*;

/// Values of one column. Numeric missing values are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Numeric(Vec<f64>),
    Text(Vec<Option<String>>),
}

/// Render a number the way it reads as a category label: integral values
/// lose the trailing `.0`.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Numeric(v) => v.len(),
            ColumnValues::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnValues::Numeric(_))
    }

    pub fn is_missing(&self, i: usize) -> bool {
        match self {
            ColumnValues::Numeric(v) => v[i].is_nan(),
            ColumnValues::Text(v) => v[i].is_none(),
        }
    }

    pub fn missing_mask(&self) -> Vec<bool> {
        (0..self.len()).map(|i| self.is_missing(i)).collect()
    }

    /// Numeric view of one cell. Unparseable text is `NaN`.
    pub fn as_f64(&self, i: usize) -> f64 {
        match self {
            ColumnValues::Numeric(v) => v[i],
            ColumnValues::Text(v) => v[i]
                .as_deref()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(f64::NAN),
        }
    }

    /// Label view of one cell.
    pub fn as_text(&self, i: usize) -> Option<String> {
        match self {
            ColumnValues::Numeric(v) if v[i].is_nan() => None,
            ColumnValues::Numeric(v) => Some(format_number(v[i])),
            ColumnValues::Text(v) => v[i].clone(),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            ColumnValues::Numeric(v) => v.clone(),
            _ => (0..self.len()).map(|i| self.as_f64(i)).collect(),
        }
    }

    pub fn to_text_vec(&self) -> Vec<Option<String>> {
        match self {
            ColumnValues::Text(v) => v.clone(),
            _ => (0..self.len()).map(|i| self.as_text(i)).collect(),
        }
    }

    /// Keep the cells at the given positions, in order.
    pub fn select(&self, positions: &[usize]) -> Self {
        match self {
            ColumnValues::Numeric(v) => ColumnValues::Numeric(positions.iter().map(|&p| v[p]).collect()),
            ColumnValues::Text(v) => ColumnValues::Text(positions.iter().map(|&p| v[p].clone()).collect()),
        }
    }

    /// Remove the cells whose mask entry is `true`.
    pub fn drop_rows(&self, mask: &[bool]) -> Self {
        let kept: Vec<usize> = (0..self.len()).filter(|&i| !mask[i]).collect();
        self.select(&kept)
    }

    fn to_column(&self, name: &str) -> Column {
        match self {
            ColumnValues::Numeric(v) => {
                let values: Vec<Option<f64>> =
                    v.iter().map(|x| if x.is_nan() { None } else { Some(*x) }).collect();
                Series::new(name.into(), values).into()
            }
            ColumnValues::Text(v) => {
                let values: Vec<Option<&str>> = v.iter().map(|x| x.as_deref()).collect();
                Series::new(name.into(), values).into()
            }
        }
    }
}

/// Convert a polars column: numeric and boolean dtypes become `Numeric`,
/// anything else is cast to string.
pub fn column_values_from_polars(col: &Column) -> Result<ColumnValues> {
    let values = match col.dtype() {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 |
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 |
        DataType::Float32 | DataType::Float64 | DataType::Boolean => {
            let casted = col.cast(&DataType::Float64)
                .map_err(|e| PrepError::DataError(format!("{}: {}", col.name(), e)))?;
            let ca = casted.f64()
                .map_err(|e| PrepError::DataError(format!("{}: {}", col.name(), e)))?;
            ColumnValues::Numeric(ca.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
        }
        _ => {
            let casted = col.cast(&DataType::String)
                .map_err(|e| PrepError::DataError(format!("{}: {}", col.name(), e)))?;
            let ca = casted.str()
                .map_err(|e| PrepError::DataError(format!("{}: {}", col.name(), e)))?;
            ColumnValues::Text(ca.into_iter().map(|v| v.map(|s| s.to_string())).collect())
        }
    };
    Ok(values)
}

/// Row-id indexed copy of the raw input. Row ids survive row drops so that
/// side channels and builder columns can be realigned.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFrame {
    index: Vec<usize>,
    columns: Vec<(String, ColumnValues)>,
}

impl InputFrame {
    pub fn new(columns: Vec<(String, ColumnValues)>) -> Result<Self> {
        let height = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        if let Some((name, c)) = columns.iter().find(|(_, c)| c.len() != height) {
            return Err(PrepError::ShapeError {
                expected: format!("{} rows", height),
                actual: format!("{} rows in column {}", c.len(), name),
            });
        }
        Ok(Self {
            index: (0..height).collect(),
            columns,
        })
    }

    pub fn from_dataframe(df: &DataFrame) -> Result<Self> {
        let columns = df
            .get_columns()
            .iter()
            .map(|col| Ok((col.name().to_string(), column_values_from_polars(col)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(columns)
    }

    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let cols: Vec<Column> = self.columns.iter().map(|(n, c)| c.to_column(n)).collect();
        Ok(DataFrame::new(cols)?)
    }

    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn height(&self) -> usize {
        self.index.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnValues> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn column(&self, name: &str) -> Result<&ColumnValues> {
        self.get_column(name)
            .ok_or_else(|| PrepError::ColumnNotFound(name.to_string()))
    }

    /// Copy of the named columns, keeping the row ids.
    pub fn subset(&self, names: &[String]) -> Result<InputFrame> {
        let columns = names
            .iter()
            .map(|n| Ok((n.clone(), self.column(n)?.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(InputFrame {
            index: self.index.clone(),
            columns,
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnValues)> {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    /// Add or replace a column.
    pub fn set_column(&mut self, name: &str, values: ColumnValues) -> Result<()> {
        if values.len() != self.height() && !self.columns.is_empty() {
            return Err(PrepError::ShapeError {
                expected: format!("{} rows", self.height()),
                actual: format!("{} rows in column {}", values.len(), name),
            });
        }
        if self.columns.is_empty() {
            self.index = (0..values.len()).collect();
        }
        match self.columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, c)) => *c = values,
            None => self.columns.push((name.to_string(), values)),
        }
        Ok(())
    }

    /// Position of a row id, if still present.
    pub fn position_of(&self, row_id: usize) -> Option<usize> {
        self.index.binary_search(&row_id).ok()
    }

    /// Remove the rows whose mask entry is `true`.
    pub fn drop_rows(&mut self, mask: &[bool]) {
        self.index = self
            .index
            .iter()
            .zip(mask)
            .filter(|(_, &m)| !m)
            .map(|(i, _)| *i)
            .collect();
        for (_, c) in self.columns.iter_mut() {
            *c = c.drop_rows(mask);
        }
    }

    /// Remove the rows whose id is in `row_ids`.
    pub fn drop_row_ids(&mut self, row_ids: &[usize]) {
        if row_ids.is_empty() {
            return;
        }
        let mask: Vec<bool> = self.index.iter().map(|i| row_ids.binary_search(i).is_ok()).collect();
        self.drop_rows(&mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_df() -> DataFrame {
        df!(
            "age" => &[Some(25i64), None, Some(40)],
            "city" => &[Some("Paris"), Some("Lyon"), None],
            "flag" => &[true, false, true],
        )
        .unwrap()
    }

    #[test]
    fn test_from_dataframe_types() {
        let frame = InputFrame::from_dataframe(&sample_df()).unwrap();
        assert_eq!(frame.height(), 3);
        assert!(frame.column("age").unwrap().is_numeric());
        assert!(frame.column("age").unwrap().is_missing(1));
        assert_eq!(frame.column("flag").unwrap().as_f64(0), 1.0);
        assert_eq!(frame.column("city").unwrap().as_text(0).as_deref(), Some("Paris"));
        assert!(frame.column("city").unwrap().is_missing(2));
    }

    #[test]
    fn test_drop_rows_keeps_row_ids() {
        let mut frame = InputFrame::from_dataframe(&sample_df()).unwrap();
        frame.drop_rows(&[false, true, false]);
        assert_eq!(frame.index(), &[0, 2]);
        assert_eq!(frame.column("age").unwrap().as_f64(1), 40.0);

        frame.drop_row_ids(&[2]);
        assert_eq!(frame.index(), &[0]);
    }

    #[test]
    fn test_round_trip_to_dataframe() {
        let frame = InputFrame::from_dataframe(&sample_df()).unwrap();
        let df = frame.to_dataframe().unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(df.column("age").unwrap().null_count(), 1);
    }

    #[test]
    fn test_missing_column() {
        let frame = InputFrame::from_dataframe(&sample_df()).unwrap();
        assert!(matches!(frame.column("nope"), Err(PrepError::ColumnNotFound(_))));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(2.5), "2.5");
    }
}
