//! Per-level coefficient bookkeeping for the multistep scheduler.
//!
//! Each basis keeps one process-local partial coefficient table per level.
//! On a sub-step advancing levels `m..=max`, only those levels' partials are
//! re-accumulated; the rest persist from their last accumulation. The
//! authoritative table is always the collective reduction of the sum of all
//! per-level partials, so multistep bookkeeping changes nothing about the
//! physical result.
//!
//! Level changes between sub-steps are buffered as signed deltas (subtract
//! at the old level, add at the new one) and committed at the next
//! level-synchronization boundary, so a contribution can never be re-added
//! without first being removed.

use crate::coeff::CoeffTable;

/// Per-level partial tables plus buffered level-change deltas.
#[derive(Debug, Clone)]
pub struct MultistepTables {
    levels: Vec<CoeffTable>,
    pending: Vec<CoeffTable>,
    /// Occupancy counter per level (particles that contributed).
    pub used: Vec<u64>,
    /// Accumulated mass per level.
    pub mass: Vec<f64>,
}

impl MultistepTables {
    /// Allocate tables for levels `0..=max_level` with the given shape.
    pub fn new(max_level: usize, rows: usize, nmax: usize) -> Self {
        let nlev = max_level + 1;
        Self {
            levels: (0..nlev).map(|_| CoeffTable::new(rows, nmax)).collect(),
            pending: (0..nlev).map(|_| CoeffTable::new(rows, nmax)).collect(),
            used: vec![0; nlev],
            mass: vec![0.0; nlev],
        }
    }

    /// Highest level index.
    pub fn max_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Partial table for `level`.
    pub fn level(&self, level: usize) -> &CoeffTable {
        &self.levels[level]
    }

    /// Mutable partial table for `level`.
    pub fn level_mut(&mut self, level: usize) -> &mut CoeffTable {
        &mut self.levels[level]
    }

    /// Mutable buffered-delta table for `level`.
    pub fn pending_mut(&mut self, level: usize) -> &mut CoeffTable {
        &mut self.pending[level]
    }

    /// Zero the partials (and counters) for levels `mlevel..=max`, ahead of
    /// their re-accumulation.
    pub fn zero_from(&mut self, mlevel: usize) {
        for lev in mlevel..self.levels.len() {
            self.levels[lev].zero();
            self.used[lev] = 0;
            self.mass[lev] = 0.0;
        }
    }

    /// Commit buffered level-change deltas for levels `0..=m` into the
    /// partials and clear them. Called at a level-synchronization boundary.
    pub fn commit(&mut self, m: usize) {
        let top = m.min(self.max_level());
        for lev in 0..=top {
            self.levels[lev].add_from(&self.pending[lev]);
            self.pending[lev].zero();
        }
    }

    /// Zero occupancy and mass counters for a fresh accumulation window.
    /// Partial tables are left alone; the next accumulation overwrites them.
    pub fn reset(&mut self) {
        self.used.fill(0);
        self.mass.fill(0.0);
    }

    /// Sum all per-level partials into `out` (which is zeroed first).
    pub fn total_into(&self, out: &mut CoeffTable) {
        out.zero();
        for lev in &self.levels {
            out.add_from(lev);
        }
    }

    /// Total occupancy across levels.
    pub fn total_used(&self) -> u64 {
        self.used.iter().sum()
    }

    /// Total accumulated mass across levels.
    pub fn total_mass(&self) -> f64 {
        self.mass.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(rows: usize, nmax: usize, seed: f64) -> CoeffTable {
        let mut t = CoeffTable::new(rows, nmax);
        for row in 0..rows {
            for n in 0..nmax {
                t.accumulate(row, n, seed * (row + 1) as f64, seed * (n + 1) as f64);
            }
        }
        t
    }

    #[test]
    fn commit_folds_pending_deltas() {
        let mut ms = MultistepTables::new(2, 2, 3);
        let c = contribution(2, 3, 1.5);

        // Particle contributes at level 0, then moves 0 -> 2.
        ms.level_mut(0).add_from(&c);
        ms.pending_mut(0).sub_from(&c);
        ms.pending_mut(2).add_from(&c);

        // Before the boundary, level 0 still carries the contribution.
        let mut total = CoeffTable::new(2, 3);
        ms.total_into(&mut total);
        assert!((total.l1_norm() - c.l1_norm()).abs() < 1e-12);

        ms.commit(2);
        ms.total_into(&mut total);
        // Total is unchanged by the move...
        assert!((total.l1_norm() - c.l1_norm()).abs() < 1e-12);
        // ...but the contribution now lives at level 2.
        assert_eq!(ms.level(0).l1_norm(), 0.0);
        assert!((ms.level(2).l1_norm() - c.l1_norm()).abs() < 1e-12);
    }

    #[test]
    fn commit_respects_level_bound() {
        let mut ms = MultistepTables::new(2, 1, 1);
        ms.pending_mut(2).accumulate(0, 0, 1.0, 0.0);
        ms.commit(1);
        assert_eq!(ms.level(2).l1_norm(), 0.0);
        ms.commit(2);
        assert_eq!(ms.level(2).l1_norm(), 1.0);
    }

    #[test]
    fn zero_from_clears_upper_levels_only() {
        let mut ms = MultistepTables::new(2, 1, 1);
        for lev in 0..=2 {
            ms.level_mut(lev).accumulate(0, 0, 1.0, 0.0);
            ms.used[lev] = 5;
            ms.mass[lev] = 2.0;
        }
        ms.zero_from(1);
        assert_eq!(ms.level(0).l1_norm(), 1.0);
        assert_eq!(ms.level(1).l1_norm(), 0.0);
        assert_eq!(ms.level(2).l1_norm(), 0.0);
        assert_eq!(ms.total_used(), 5);
        assert_eq!(ms.total_mass(), 2.0);
    }

    #[test]
    fn reset_clears_counters_not_tables() {
        let mut ms = MultistepTables::new(1, 1, 1);
        ms.level_mut(0).accumulate(0, 0, 3.0, 0.0);
        ms.used[0] = 7;
        ms.mass[0] = 4.0;
        ms.reset();
        assert_eq!(ms.total_used(), 0);
        assert_eq!(ms.total_mass(), 0.0);
        assert_eq!(ms.level(0).l1_norm(), 3.0);
    }
}
