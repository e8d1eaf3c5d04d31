//! Cylindrical (disk) basis over empirically refitted `(R, z)` tables.

use std::thread;

use crate::coeff::CoeffTable;
use crate::comm::Collective;
use crate::multistep::MultistepTables;
use crate::particle::{LevelLists, ParticleSet};
use crate::tables::{CylParams, CylTable};
use crate::{chunk_ranges, FieldMode, ForceBasis};

/// Minimum cylindrical radius; on-axis particles are offset, not rejected.
const RCYL_SOFT: f64 = 1e-8;

/// Configuration for a [`CylinderBasis`].
#[derive(Debug, Clone)]
pub struct CylinderConfig {
    /// Table shape and scale parameters.
    pub params: CylParams,
    /// Accumulation/evaluation thread count.
    pub threads: usize,
    /// Multistep levels `0..=max_level`.
    pub max_level: usize,
    /// Rebuild the tables from the particles every `nrecomp` full
    /// accumulation cycles; 0 disables refitting.
    pub nrecomp: usize,
    /// When false, coefficients freeze after the first accumulation and
    /// the basis acts as a fixed external potential.
    pub self_consistent: bool,
    /// Optional binary table cache to read at startup.
    pub cache_file: Option<String>,
}

impl Default for CylinderConfig {
    fn default() -> Self {
        Self {
            params: CylParams {
                mmax: 6,
                norder: 8,
                ascale: 1.0,
                hscale: 0.1,
                rfac: 20.0,
                zfac: 40.0,
                nx: 128,
                nz: 65,
            },
            threads: 1,
            max_level: 0,
            nrecomp: 0,
            self_consistent: true,
            cache_file: None,
        }
    }
}

/// Disk force basis: azimuthal orders `0..=mmax` by radial orders
/// `0..norder`, evaluated from tabulated `(R, z)` grids.
///
/// Particles outside the tabulated envelope (`R^2 + z^2 >= rmax^2`) are
/// excluded from accumulation and see a point-mass monopole instead, using
/// the mass from the latest completed accumulation window.
pub struct CylinderBasis {
    cfg: CylinderConfig,
    table: CylTable,
    center: [f64; 3],
    ms: MultistepTables,
    total: CoeffTable,
    global_mass: f64,
    global_used: f64,
    /// Monopole fallback mass; lags `global_mass` by one window.
    stale_mass: f64,
    cycles: u64,
    initialized: bool,
}

impl CylinderBasis {
    /// Build the basis. A configured cache is tried first; a missing or
    /// corrupt cache is logged and the tables rebuilt from the analytic
    /// seed family.
    pub fn new(cfg: CylinderConfig) -> Self {
        let table = match cfg.cache_file.as_deref() {
            Some(path) => match CylTable::read_cache(path) {
                Ok(t) => {
                    if *t.params() == cfg.params {
                        tracing::info!("loaded basis table cache from {}", path);
                        t
                    } else {
                        tracing::warn!(
                            "basis table cache {} has mismatched parameters, rebuilding",
                            path
                        );
                        CylTable::analytic(cfg.params)
                    }
                }
                Err(e) => {
                    tracing::warn!("{}; rebuilding tables", e);
                    CylTable::analytic(cfg.params)
                }
            },
            None => CylTable::analytic(cfg.params),
        };
        let rows = cfg.params.mmax + 1;
        let norder = cfg.params.norder;
        Self {
            ms: MultistepTables::new(cfg.max_level, rows, norder),
            total: CoeffTable::new(rows, norder),
            table,
            center: [0.0; 3],
            global_mass: 0.0,
            global_used: 0.0,
            stale_mass: 0.0,
            cycles: 0,
            initialized: false,
            cfg,
        }
    }

    /// Reduced total table (valid only after `compute_coefficients`).
    pub fn coefficients(&self) -> &CoeffTable {
        &self.total
    }

    /// Globally reduced mass inside the envelope this window.
    pub fn global_mass(&self) -> f64 {
        self.global_mass
    }

    /// Write the current tables to a binary cache file.
    pub fn dump_cache(&self, path: &str) -> Result<(), String> {
        self.table.write_cache(path)
    }

    #[inline]
    fn inside_envelope(&self, dx: f64, dy: f64, dz: f64) -> bool {
        let rmax = self.cfg.params.rmax();
        dx * dx + dy * dy + dz * dz < rmax * rmax
    }

    /// Add (or with negative `mass`, remove) one particle's contribution.
    /// Outside the envelope a particle contributes nothing.
    fn accumulate_particle(&self, into: &mut CoeffTable, mass: f64, pos: [f64; 3]) -> bool {
        let dx = pos[0] - self.center[0];
        let dy = pos[1] - self.center[1];
        let dz = pos[2] - self.center[2];
        if !self.inside_envelope(dx, dy, dz) {
            return false;
        }
        let big_r = (dx * dx + dy * dy).sqrt().max(RCYL_SOFT);
        let phi = dy.atan2(dx);

        for m in 0..=self.cfg.params.mmax {
            // Negative norm of the potential-density pairing, with the
            // usual duplication factor for m > 0.
            let fac = -mass * if m == 0 { 1.0 } else { 2.0 };
            let (smp, cmp) = (m as f64 * phi).sin_cos();
            for n in 0..self.cfg.params.norder {
                let v = self.table.value(m, n, big_r, dz);
                into.accumulate(m, n, fac * v * cmp, fac * v * smp);
            }
        }
        true
    }

    /// Potential and acceleration at an offset from the center: expansion
    /// inside the envelope, point-mass monopole outside.
    fn eval_offset(&self, dx: f64, dy: f64, dz: f64) -> (f64, [f64; 3]) {
        if !self.inside_envelope(dx, dy, dz) {
            let r2 = (dx * dx + dy * dy + dz * dz).max(RCYL_SOFT * RCYL_SOFT);
            let r = r2.sqrt();
            let m = self.stale_mass;
            let fac = -m / (r2 * r);
            return (-m / r, [fac * dx, fac * dy, fac * dz]);
        }

        let big_r = (dx * dx + dy * dy).sqrt().max(RCYL_SOFT);
        let phi = dy.atan2(dx);

        let mut pot = 0.0;
        let mut f_r = 0.0;
        let mut f_z = 0.0;
        let mut dpot_dphi = 0.0;
        for m in 0..=self.cfg.params.mmax {
            let (smp, cmp) = (m as f64 * phi).sin_cos();
            for n in 0..self.cfg.params.norder {
                let k = self.total.idx(m, n);
                let c = self.total.cos[k];
                let s = self.total.sin[k];
                let azim = c * cmp + s * smp;
                let v = self.table.value(m, n, big_r, dz);
                let (vr, vz) = self.table.force(m, n, big_r, dz);
                pot += azim * v;
                f_r += azim * vr;
                f_z += azim * vz;
                dpot_dphi += m as f64 * (s * cmp - c * smp) * v;
            }
        }
        let f_phi = -dpot_dphi / big_r;

        let (cosp, sinp) = (dx / big_r, dy / big_r);
        (
            pot,
            [
                f_r * cosp - f_phi * sinp,
                f_r * sinp + f_phi * cosp,
                f_z,
            ],
        )
    }
}

impl ForceBasis for CylinderBasis {
    fn compute_coefficients(
        &mut self,
        set: &ParticleSet,
        levels: &LevelLists,
        mlevel: usize,
        comm: &dyn Collective,
    ) {
        // A frozen (non-self-consistent) basis keeps its first expansion.
        if !self.cfg.self_consistent && self.initialized {
            return;
        }

        let rows = self.cfg.params.mmax + 1;
        let norder = self.cfg.params.norder;
        let mut low = mlevel.min(self.ms.max_level());

        if mlevel == 0 {
            self.cycles += 1;
            // Periodic empirical refit; forces a full re-accumulation and
            // supersedes any incremental path this cycle.
            if self.cfg.nrecomp > 0 && self.cycles % self.cfg.nrecomp as u64 == 0 {
                self.table = CylTable::rebuild_from(self.cfg.params, set, self.center);
                low = 0;
            }
        }

        self.ms.zero_from(low);
        for lev in low..=levels.max_level().min(self.ms.max_level()) {
            let idxs = levels.at(lev);
            let ranges = chunk_ranges(idxs.len(), self.cfg.threads);

            let this = &*self;
            let results: Vec<(CoeffTable, u64, f64)> = thread::scope(|s| {
                let handles: Vec<_> = ranges
                    .iter()
                    .map(|&(beg, end)| {
                        s.spawn(move || {
                            let mut local = CoeffTable::new(rows, norder);
                            let mut used = 0u64;
                            let mut mass = 0.0;
                            for &i in &idxs[beg..end] {
                                if set.frozen[i] {
                                    continue;
                                }
                                let m = set.mass[i];
                                if this.accumulate_particle(&mut local, m, set.position(i)) {
                                    used += 1;
                                    mass += m;
                                }
                            }
                            (local, used, mass)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("accumulation thread panicked"))
                    .collect()
            });

            for (local, used, mass) in results {
                self.ms.level_mut(lev).add_from(&local);
                self.ms.used[lev] += used;
                self.ms.mass[lev] += mass;
            }
        }

        // Reduce coefficients together with the occupancy and mass
        // counters; the previous window's mass backs the monopole fallback.
        self.stale_mass = self.global_mass;
        self.ms.total_into(&mut self.total);
        let size = rows * norder;
        let mut buf = vec![0.0; 2 * size + 2];
        buf[..size].copy_from_slice(&self.total.cos);
        buf[size..2 * size].copy_from_slice(&self.total.sin);
        buf[2 * size] = self.ms.total_mass();
        buf[2 * size + 1] = self.ms.total_used() as f64;
        comm.allreduce_sum(&mut buf);
        self.total.cos.copy_from_slice(&buf[..size]);
        self.total.sin.copy_from_slice(&buf[size..2 * size]);
        self.global_mass = buf[2 * size];
        self.global_used = buf[2 * size + 1];

        self.total.valid = true;
        self.initialized = true;
        tracing::debug!(
            "cylindrical coefficients reduced: mlevel={} mass={:.6} used={}",
            mlevel,
            self.global_mass,
            self.global_used
        );
    }

    fn apply_field(
        &self,
        set: &mut ParticleSet,
        levels: &LevelLists,
        mlevel: usize,
        mode: FieldMode,
    ) {
        debug_assert!(self.total.valid, "field evaluation from an unreduced table");

        for lev in mlevel..=levels.max_level() {
            let idxs = levels.at(lev);
            let ranges = chunk_ranges(idxs.len(), self.cfg.threads);

            let this = &*self;
            let frozen = &set.frozen;
            let (xs, ys, zs) = (&set.x, &set.y, &set.z);
            let results: Vec<Vec<(usize, f64, [f64; 3])>> = thread::scope(|s| {
                let handles: Vec<_> = ranges
                    .iter()
                    .map(|&(beg, end)| {
                        s.spawn(move || {
                            let mut out = Vec::with_capacity(end - beg);
                            for &i in &idxs[beg..end] {
                                if frozen[i] {
                                    continue;
                                }
                                let (pot, acc) = this.eval_offset(
                                    xs[i] - this.center[0],
                                    ys[i] - this.center[1],
                                    zs[i] - this.center[2],
                                );
                                out.push((i, pot, acc));
                            }
                            out
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("evaluation thread panicked"))
                    .collect()
            });

            for chunk in results {
                for (i, pot, acc) in chunk {
                    set.ax[i] += acc[0];
                    set.ay[i] += acc[1];
                    set.az[i] += acc[2];
                    match mode {
                        FieldMode::SelfField => set.pot[i] += pot,
                        FieldMode::External => set.potext[i] += pot,
                    }
                }
            }
        }
    }

    fn field_at(&self, pos: [f64; 3]) -> (f64, [f64; 3]) {
        self.eval_offset(
            pos[0] - self.center[0],
            pos[1] - self.center[1],
            pos[2] - self.center[2],
        )
    }

    fn multistep_update(&mut self, from: usize, to: usize, set: &ParticleSet, idx: usize) {
        if from == to || set.frozen[idx] {
            return;
        }
        let rows = self.cfg.params.mmax + 1;
        let mut delta = CoeffTable::new(rows, self.cfg.params.norder);
        if self.accumulate_particle(&mut delta, set.mass[idx], set.position(idx)) {
            self.ms.pending_mut(from).sub_from(&delta);
            self.ms.pending_mut(to).add_from(&delta);
        }
    }

    fn multistep_swap(&mut self, m: usize) {
        self.ms.commit(m);
    }

    fn multistep_reset(&mut self) {
        self.ms.reset();
    }

    fn set_center(&mut self, center: [f64; 3]) {
        self.center = center;
    }

    fn center(&self) -> [f64; 3] {
        self.center
    }

    fn dump_coefficients(&self, out: &mut dyn std::io::Write) -> Result<(), String> {
        crate::dump_table("cylindrical", &self.total, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SoloCollective;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn small_cfg() -> CylinderConfig {
        CylinderConfig {
            params: CylParams {
                mmax: 2,
                norder: 4,
                ascale: 1.0,
                hscale: 0.2,
                rfac: 5.0,
                zfac: 10.0,
                nx: 32,
                nz: 17,
            },
            threads: 2,
            max_level: 1,
            nrecomp: 0,
            self_consistent: true,
            cache_file: None,
        }
    }

    fn disk_set(n: usize, seed: u64) -> ParticleSet {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = ParticleSet::new();
        for _ in 0..n {
            let r = rng.gen_range(0.2..3.0);
            let phi = rng.gen_range(0.0..std::f64::consts::TAU);
            set.push_particle(
                1.0,
                [r * phi.cos(), r * phi.sin(), rng.gen_range(-0.3..0.3)],
                [0.0; 3],
            );
        }
        set
    }

    #[test]
    fn boundary_particle_takes_exactly_one_branch() {
        let mut set = disk_set(100, 1);
        let rmax = small_cfg().params.rmax();
        // One particle exactly on the envelope: excluded from the
        // expansion, served by the monopole.
        set.push_particle(1.0, [rmax, 0.0, 0.0], [0.0; 3]);
        let levels = LevelLists::build(&set, 1);
        let mut basis = CylinderBasis::new(small_cfg());

        // Two windows so the fallback mass is nonzero.
        basis.compute_coefficients(&set, &levels, 0, &SoloCollective);
        basis.compute_coefficients(&set, &levels, 0, &SoloCollective);
        assert!((basis.global_mass() - 100.0).abs() < 1e-12);

        let (pot, acc) = basis.field_at([rmax, 0.0, 0.0]);
        assert!(pot.is_finite() && acc.iter().all(|a| a.is_finite()));
        // Monopole form, from the previous window's mass.
        assert!((pot + 100.0 / rmax).abs() < 1e-9);
        assert!((acc[0] + 100.0 / (rmax * rmax)).abs() < 1e-9);
    }

    #[test]
    fn fallback_mass_lags_one_window() {
        let set1 = disk_set(10, 2);
        let mut set2 = set1.clone();
        set2.push_particle(5.0, [1.0, 0.0, 0.0], [0.0; 3]);
        let lev1 = LevelLists::build(&set1, 1);
        let lev2 = LevelLists::build(&set2, 1);
        let mut basis = CylinderBasis::new(small_cfg());

        basis.compute_coefficients(&set1, &lev1, 0, &SoloCollective);
        basis.compute_coefficients(&set2, &lev2, 0, &SoloCollective);
        // Outside the envelope the monopole still sees the first window.
        let far = small_cfg().params.rmax() + 5.0;
        let (pot, _) = basis.field_at([far, 0.0, 0.0]);
        assert!((pot + 10.0 / far).abs() < 1e-9);
    }

    #[test]
    fn disk_field_attracts_inside_envelope() {
        let set = disk_set(500, 3);
        let levels = LevelLists::build(&set, 1);
        let mut basis = CylinderBasis::new(small_cfg());
        basis.compute_coefficients(&set, &levels, 0, &SoloCollective);

        let (pot, acc) = basis.field_at([2.0, 0.0, 0.0]);
        assert!(pot < 0.0);
        assert!(acc[0] < 0.0);
    }

    #[test]
    fn non_self_consistent_basis_freezes_after_first_pass() {
        let set1 = disk_set(50, 4);
        let mut set2 = set1.clone();
        for m in set2.mass.iter_mut() {
            *m *= 10.0;
        }
        let levels = LevelLists::build(&set1, 1);
        let mut basis = CylinderBasis::new(CylinderConfig {
            self_consistent: false,
            ..small_cfg()
        });

        basis.compute_coefficients(&set1, &levels, 0, &SoloCollective);
        let frozen = basis.coefficients().clone();
        basis.compute_coefficients(&set2, &levels, 0, &SoloCollective);
        assert_eq!(basis.coefficients().max_abs_diff(&frozen), 0.0);
    }

    #[test]
    fn periodic_refit_changes_table_scales() {
        let set = disk_set(200, 5);
        let levels = LevelLists::build(&set, 1);
        let mut basis = CylinderBasis::new(CylinderConfig {
            nrecomp: 2,
            ..small_cfg()
        });
        let before = *basis.table.params();
        basis.compute_coefficients(&set, &levels, 0, &SoloCollective);
        assert_eq!(*basis.table.params(), before);
        basis.compute_coefficients(&set, &levels, 0, &SoloCollective);
        let after = *basis.table.params();
        assert!(after.ascale != before.ascale || after.hscale != before.hscale);
    }

    #[test]
    fn threaded_accumulation_matches_single_thread() {
        let set = disk_set(150, 6);
        let levels = LevelLists::build(&set, 1);
        let mut one = CylinderBasis::new(CylinderConfig {
            threads: 1,
            ..small_cfg()
        });
        let mut four = CylinderBasis::new(CylinderConfig {
            threads: 4,
            ..small_cfg()
        });
        one.compute_coefficients(&set, &levels, 0, &SoloCollective);
        four.compute_coefficients(&set, &levels, 0, &SoloCollective);
        assert!(one.coefficients().max_abs_diff(four.coefficients()) < 1e-9);
    }
}
