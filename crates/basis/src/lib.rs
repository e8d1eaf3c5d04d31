//! Biorthogonal basis-expansion force solver.
//!
//! A component's gravitational field is represented by a truncated expansion
//! over a biorthogonal basis set. Each force pass has two phases with a
//! collective reduction between them: accumulate expansion coefficients from
//! the local particles, reduce across workers, then evaluate potential and
//! acceleration from the reduced coefficients. Between reductions the
//! expansion is frozen, so field evaluation at any point is embarrassingly
//! parallel.
//!
//! Two basis families ship here: [`spherical::SphericalBasis`] for
//! spheroidal components and [`cylinder::CylinderBasis`] for disks.

#![warn(missing_docs)]

pub mod coeff;
pub mod comm;
pub mod cylinder;
pub mod multistep;
pub mod particle;
pub mod pca;
pub mod spherical;
pub mod tables;

pub use coeff::CoeffTable;
pub use comm::{Collective, LocalCluster, SoloCollective};
pub use particle::{LevelLists, ParticleSet};

/// Which potential slot a field evaluation writes.
///
/// Acceleration always accumulates into `ax/ay/az`; the potential goes into
/// `pot` when a component evaluates its own field and into `potext` when the
/// field comes from another component or an external perturbation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMode {
    /// The component's own field acting on its own particles.
    SelfField,
    /// A foreign field acting on these particles.
    External,
}

/// A force solver backed by a basis expansion.
///
/// Implementations own their coefficient state, including the per-level
/// multistep partial tables. `compute_coefficients` and the multistep calls
/// are collective (every worker must make them in the same order with the
/// same arguments); `apply_field` and `field_at` are purely local reads.
pub trait ForceBasis: Send {
    /// Re-accumulate coefficients for particles at levels `mlevel..=max`
    /// from the local slice of `set`, then reduce the full table across
    /// workers. On return the total table is valid on every worker.
    fn compute_coefficients(
        &mut self,
        set: &ParticleSet,
        levels: &LevelLists,
        mlevel: usize,
        comm: &dyn Collective,
    );

    /// Evaluate the current expansion at the particles in levels
    /// `mlevel..=max`, accumulating acceleration and writing the potential
    /// slot selected by `mode`. Frozen particles are skipped.
    fn apply_field(
        &self,
        set: &mut ParticleSet,
        levels: &LevelLists,
        mlevel: usize,
        mode: FieldMode,
    );

    /// Evaluate the current expansion at an arbitrary point (relative to
    /// world coordinates). Returns `(potential, acceleration)`.
    fn field_at(&self, pos: [f64; 3]) -> (f64, [f64; 3]);

    /// Buffer the coefficient delta for particle `idx` of `set` moving from
    /// level `from` to level `to`. Local bookkeeping only; takes effect at
    /// the next [`ForceBasis::multistep_swap`].
    fn multistep_update(&mut self, from: usize, to: usize, set: &ParticleSet, idx: usize);

    /// Commit buffered level-change deltas for levels `0..=m`. Called at a
    /// level-synchronization boundary, after the barrier.
    fn multistep_swap(&mut self, m: usize);

    /// Clear per-level occupancy counters for a fresh accumulation window.
    fn multistep_reset(&mut self);

    /// Set the expansion center in world coordinates.
    fn set_center(&mut self, center: [f64; 3]);

    /// Current expansion center.
    fn center(&self) -> [f64; 3];

    /// Write the reduced coefficient table as text, one `(row, order)`
    /// entry per line, for diagnostics and offline analysis.
    fn dump_coefficients(&self, out: &mut dyn std::io::Write) -> Result<(), String>;
}

/// Shared text writer behind [`ForceBasis::dump_coefficients`].
pub(crate) fn dump_table(
    label: &str,
    table: &CoeffTable,
    out: &mut dyn std::io::Write,
) -> Result<(), String> {
    let err = |e: std::io::Error| format!("Failed to dump {} coefficients: {}", label, e);
    writeln!(out, "# {} rows={} nmax={}", label, table.rows(), table.nmax()).map_err(err)?;
    for row in 0..table.rows() {
        for n in 0..table.nmax() {
            let k = table.idx(row, n);
            writeln!(out, "{} {} {:.17e} {:.17e}", row, n, table.cos[k], table.sin[k])
                .map_err(err)?;
        }
    }
    Ok(())
}

/// Split `0..n` into `threads` contiguous ranges, as evenly as integer
/// division allows. Used to hand each worker thread its slice of an index
/// list.
pub fn chunk_ranges(n: usize, threads: usize) -> Vec<(usize, usize)> {
    let threads = threads.max(1);
    (0..threads)
        .map(|t| (n * t / threads, n * (t + 1) / threads))
        .collect()
}
