//! Incremental Gauss-Jordan elimination over GF(256)
//!
//! Shared by the stream sink and the block decoder. Rows are kept fully
//! reduced: every pivot column is zero in all other rows, so a symbol is
//! recovered exactly when its row has a single non-zero coefficient.

use crate::gf256;

pub struct Row {
    pub coeffs: Vec<u8>,
    pub data: Vec<u8>,
    pub pivot: usize,
}

impl Row {
    /// True when the row pins down a single symbol
    pub fn is_unit(&self) -> bool {
        self.coeffs.iter().filter(|&&c| c != 0).count() == 1
    }
}

/// A reduced matrix of pending combinations
pub struct Eliminator {
    cols: usize,
    rows: Vec<Row>,
}

impl Eliminator {
    pub fn new(cols: usize) -> Self {
        Self { cols, rows: Vec::new() }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rank(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Widen the matrix to `cols` columns
    pub fn grow(&mut self, cols: usize) {
        if cols <= self.cols {
            return;
        }
        for row in &mut self.rows {
            row.coeffs.resize(cols, 0);
        }
        self.cols = cols;
    }

    /// Insert a combination; returns false when it was linearly
    /// dependent on what the matrix already holds
    pub fn insert(&mut self, mut coeffs: Vec<u8>, mut data: Vec<u8>) -> bool {
        debug_assert_eq!(coeffs.len(), self.cols);

        // Reduce against existing pivots
        for row in &self.rows {
            let c = coeffs[row.pivot];
            if c != 0 {
                gf256::mul_add_assign(&mut coeffs, &row.coeffs, c);
                gf256::mul_add_assign(&mut data, &row.data, c);
            }
        }

        let Some(pivot) = coeffs.iter().position(|&c| c != 0) else {
            return false;
        };

        // Normalize the pivot to one
        let scale = gf256::inv(coeffs[pivot]).expect("pivot is non-zero");
        gf256::scale_assign(&mut coeffs, scale);
        gf256::scale_assign(&mut data, scale);

        // Clear the new pivot column from every other row
        for row in &mut self.rows {
            let c = row.coeffs[pivot];
            if c != 0 {
                gf256::mul_add_assign(&mut row.coeffs, &coeffs, c);
                gf256::mul_add_assign(&mut row.data, &data, c);
            }
        }

        self.rows.push(Row { coeffs, data, pivot });
        true
    }

    /// The data of the unit row pinning column `col`, if decoded
    pub fn decoded(&self, col: usize) -> Option<&[u8]> {
        self.rows
            .iter()
            .find(|row| row.pivot == col && row.is_unit())
            .map(|row| row.data.as_slice())
    }

    /// Remove the unit row for column `col` and drop that column,
    /// shifting the remaining columns left. Only valid when `decoded`
    /// returned a value for the column.
    pub fn remove_column(&mut self, col: usize) {
        self.rows.retain(|row| row.pivot != col);
        for row in &mut self.rows {
            debug_assert_eq!(row.coeffs[col], 0, "pivot column must be cleared");
            row.coeffs.remove(col);
            if row.pivot > col {
                row.pivot -= 1;
            }
        }
        self.cols -= 1;
    }
}
