/*!
Input data scaling
*/
use crate::error::{Error, Result};
use crate::CpuFloat;
use serde::{Deserialize, Serialize};

/// A per-column min-max scaler onto `[0, 1]`, tied to the ordered columns it was fitted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    /// The columns this scaler was fitted on, in order
    pub columns: Vec<String>,
    /// Per-column minimum of the fitted data
    pub min: Vec<CpuFloat>,
    /// Per-column maximum of the fitted data
    pub max: Vec<CpuFloat>,
}

impl MinMaxScaler {
    /// Fit a scaler over rows of data, one value per column
    pub fn fit(columns: &[String], rows: &[Vec<CpuFloat>]) -> Result<MinMaxScaler> {
        let width = columns.len();
        let mut min = vec![CpuFloat::INFINITY; width];
        let mut max = vec![CpuFloat::NEG_INFINITY; width];
        for row in rows {
            check_width(width, row)?;
            for (i, &x) in row.iter().enumerate() {
                min[i] = min[i].min(x);
                max[i] = max[i].max(x);
            }
        }
        if rows.is_empty() {
            return Err(Error::InsufficientData {
                needed: 1,
                available: 0,
            });
        }
        Ok(MinMaxScaler {
            columns: columns.to_vec(),
            min,
            max,
        })
    }

    /// The number of columns this scaler handles
    #[inline]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Per-column range, with zero ranges replaced by one so constant columns map to zero
    #[inline]
    fn range(&self, column: usize) -> CpuFloat {
        let range = self.max[column] - self.min[column];
        if range == 0.0 {
            1.0
        } else {
            range
        }
    }

    /// Check that this scaler was fitted on exactly these columns, in this order
    pub fn check_columns(&self, columns: &[String]) -> Result<()> {
        if self.columns != columns {
            return Err(Error::FeatureMismatch(format!(
                "scaler fitted on {:?}, given {:?}",
                self.columns, columns
            )));
        }
        Ok(())
    }

    /// Scale one row
    pub fn transform(&self, row: &[CpuFloat]) -> Result<Vec<CpuFloat>> {
        check_width(self.width(), row)?;
        Ok(row
            .iter()
            .enumerate()
            .map(|(i, &x)| (x - self.min[i]) / self.range(i))
            .collect())
    }

    /// Undo the scaling of one row
    pub fn inverse_transform(&self, row: &[CpuFloat]) -> Result<Vec<CpuFloat>> {
        check_width(self.width(), row)?;
        Ok(row
            .iter()
            .enumerate()
            .map(|(i, &x)| x * self.range(i) + self.min[i])
            .collect())
    }

    /// Scale many rows
    pub fn transform_rows(&self, rows: &[Vec<CpuFloat>]) -> Result<Vec<Vec<CpuFloat>>> {
        rows.iter().map(|row| self.transform(row)).collect()
    }

    /// Inverse-scale a single value of one column, by inverse-transforming a full-width row
    /// which is zero everywhere except that column
    pub fn inverse_column(&self, column: usize, value: CpuFloat) -> Result<CpuFloat> {
        if column >= self.width() {
            return Err(Error::FeatureMismatch(format!(
                "column {} out of range for {} features",
                column,
                self.width()
            )));
        }
        let mut dummy = vec![0.0; self.width()];
        dummy[column] = value;
        Ok(self.inverse_transform(&dummy)?[column])
    }
}

fn check_width(width: usize, row: &[CpuFloat]) -> Result<()> {
    if row.len() != width {
        return Err(Error::FeatureMismatch(format!(
            "expected {} features, got {}",
            width,
            row.len()
        )));
    }
    Ok(())
}
