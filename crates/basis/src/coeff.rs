//! Coefficient tables: dense (harmonic row x radial order) cosine/sine pairs.

/// A dense table of expansion coefficients.
///
/// Rows index harmonic pairs (the meaning of a row is owned by the basis:
/// `(l, m)` pairs for the spherical basis, azimuthal order `m` for the
/// cylindrical one); columns index radial order. Cosine and sine terms are
/// stored separately.
///
/// The `valid` flag tracks the reduction lifecycle: a table is valid only
/// after the post-accumulation collective reduction has completed. Zeroing
/// the table invalidates it; consumers must not evaluate forces from an
/// invalid table.
#[derive(Debug, Clone)]
pub struct CoeffTable {
    rows: usize,
    nmax: usize,
    /// Cosine coefficients, row-major `[row * nmax + n]`.
    pub cos: Vec<f64>,
    /// Sine coefficients, same layout.
    pub sin: Vec<f64>,
    /// True once the table holds a globally reduced, authoritative copy.
    pub valid: bool,
}

impl CoeffTable {
    /// Allocate a zeroed, invalid table.
    pub fn new(rows: usize, nmax: usize) -> Self {
        Self {
            rows,
            nmax,
            cos: vec![0.0; rows * nmax],
            sin: vec![0.0; rows * nmax],
            valid: false,
        }
    }

    /// Number of harmonic rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of radial orders per row.
    pub fn nmax(&self) -> usize {
        self.nmax
    }

    /// Flat index of `(row, n)`.
    #[inline]
    pub fn idx(&self, row: usize, n: usize) -> usize {
        row * self.nmax + n
    }

    /// Zero all entries and invalidate the table.
    pub fn zero(&mut self) {
        self.cos.fill(0.0);
        self.sin.fill(0.0);
        self.valid = false;
    }

    /// Add `(dc, ds)` at `(row, n)`.
    #[inline]
    pub fn accumulate(&mut self, row: usize, n: usize, dc: f64, ds: f64) {
        let k = self.idx(row, n);
        self.cos[k] += dc;
        self.sin[k] += ds;
    }

    /// Element-wise add another table of identical shape.
    pub fn add_from(&mut self, other: &CoeffTable) {
        debug_assert_eq!(self.rows, other.rows);
        debug_assert_eq!(self.nmax, other.nmax);
        for (a, b) in self.cos.iter_mut().zip(other.cos.iter()) {
            *a += b;
        }
        for (a, b) in self.sin.iter_mut().zip(other.sin.iter()) {
            *a += b;
        }
    }

    /// Element-wise subtract another table of identical shape.
    pub fn sub_from(&mut self, other: &CoeffTable) {
        debug_assert_eq!(self.rows, other.rows);
        debug_assert_eq!(self.nmax, other.nmax);
        for (a, b) in self.cos.iter_mut().zip(other.cos.iter()) {
            *a -= b;
        }
        for (a, b) in self.sin.iter_mut().zip(other.sin.iter()) {
            *a -= b;
        }
    }

    /// Multiply every entry by `s`.
    pub fn scale(&mut self, s: f64) {
        for v in self.cos.iter_mut() {
            *v *= s;
        }
        for v in self.sin.iter_mut() {
            *v *= s;
        }
    }

    /// Sum of absolute values across both halves, useful as a cheap
    /// fingerprint in diagnostics and tests.
    pub fn l1_norm(&self) -> f64 {
        self.cos.iter().map(|v| v.abs()).sum::<f64>()
            + self.sin.iter().map(|v| v.abs()).sum::<f64>()
    }

    /// Maximum absolute element-wise difference against another table.
    pub fn max_abs_diff(&self, other: &CoeffTable) -> f64 {
        let mut d = 0.0_f64;
        for (a, b) in self.cos.iter().zip(other.cos.iter()) {
            d = d.max((a - b).abs());
        }
        for (a, b) in self.sin.iter().zip(other.sin.iter()) {
            d = d.max((a - b).abs());
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_table_is_invalid_and_zero() {
        let t = CoeffTable::new(3, 4);
        assert!(!t.valid);
        assert_eq!(t.cos.len(), 12);
        assert_eq!(t.l1_norm(), 0.0);
    }

    #[test]
    fn accumulate_and_add() {
        let mut a = CoeffTable::new(2, 2);
        let mut b = CoeffTable::new(2, 2);
        a.accumulate(1, 0, 2.0, -1.0);
        b.accumulate(1, 0, 0.5, 0.5);
        a.add_from(&b);
        assert_eq!(a.cos[a.idx(1, 0)], 2.5);
        assert_eq!(a.sin[a.idx(1, 0)], -0.5);
        a.sub_from(&b);
        assert_eq!(a.cos[a.idx(1, 0)], 2.0);
    }

    #[test]
    fn zero_invalidates() {
        let mut t = CoeffTable::new(1, 1);
        t.valid = true;
        t.zero();
        assert!(!t.valid);
    }
}
