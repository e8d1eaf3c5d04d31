//! Spherical-harmonic basis over tabulated radial functions.

use std::thread;

use crate::coeff::CoeffTable;
use crate::comm::Collective;
use crate::multistep::MultistepTables;
use crate::particle::{LevelLists, ParticleSet};
use crate::pca::{self, PcaConfig};
use crate::tables::RadialTable;
use crate::{chunk_ranges, FieldMode, ForceBasis};

/// Minimum radius used in accumulation and evaluation. Particles at the
/// exact center are offset rather than rejected.
const RSOFT: f64 = 1e-8;

/// Minimum sin(theta) for the theta-gradient recurrence near the poles.
const SINTH_MIN: f64 = 1e-12;

/// Configuration for a [`SphericalBasis`].
#[derive(Debug, Clone)]
pub struct SphericalConfig {
    /// Highest harmonic order `l`.
    pub lmax: usize,
    /// Number of radial orders per harmonic.
    pub nmax: usize,
    /// Outer radius of the tabulated grid.
    pub rmax: f64,
    /// Scale length of the radial family.
    pub scale: f64,
    /// Radial grid points.
    pub numr: usize,
    /// Accumulation/evaluation thread count.
    pub threads: usize,
    /// Multistep levels `0..=max_level`.
    pub max_level: usize,
    /// Coefficient denoising setup.
    pub pca: PcaConfig,
}

impl Default for SphericalConfig {
    fn default() -> Self {
        Self {
            lmax: 4,
            nmax: 10,
            rmax: 20.0,
            scale: 1.0,
            numr: 1000,
            threads: 1,
            max_level: 0,
            pca: PcaConfig::default(),
        }
    }
}

impl SphericalConfig {
    /// Harmonic rows: `(l, m)` pairs with `0 <= m <= l <= lmax`.
    pub fn rows(&self) -> usize {
        (self.lmax + 1) * (self.lmax + 2) / 2
    }
}

/// Flat row index of the `(l, m)` pair.
#[inline]
fn lm_row(l: usize, m: usize) -> usize {
    l * (l + 1) / 2 + m
}

/// Associated Legendre values `P_lm(x)` and theta-derivatives
/// `dP_lm/dtheta` for all rows up to `lmax`, by upward recurrence.
fn legendre(lmax: usize, x: f64, plm: &mut [f64], dplm: &mut [f64]) {
    let sinth = (1.0 - x * x).max(0.0).sqrt();

    // Diagonal P_mm, then the l-ladder above each m.
    let mut pmm = 1.0;
    for m in 0..=lmax {
        plm[lm_row(m, m)] = pmm;
        if m + 1 <= lmax {
            plm[lm_row(m + 1, m)] = x * (2 * m + 1) as f64 * pmm;
        }
        for l in (m + 2)..=lmax {
            plm[lm_row(l, m)] = ((2 * l - 1) as f64 * x * plm[lm_row(l - 1, m)]
                - (l + m - 1) as f64 * plm[lm_row(l - 2, m)])
                / (l - m) as f64;
        }
        pmm *= -((2 * m + 1) as f64) * sinth;
    }

    let s = sinth.max(SINTH_MIN);
    for l in 0..=lmax {
        for m in 0..=l {
            let below = if l > 0 && m <= l - 1 {
                plm[lm_row(l - 1, m)]
            } else {
                0.0
            };
            dplm[lm_row(l, m)] = (l as f64 * x * plm[lm_row(l, m)] - (l + m) as f64 * below) / s;
        }
    }
}

/// Angular normalization per `(l, m)` row, folded in at accumulation time.
fn norm_factor(l: usize, m: usize) -> f64 {
    let mut ratio = 1.0; // (l - m)! / (l + m)!
    for k in (l - m + 1)..=(l + m) {
        ratio /= k as f64;
    }
    let dup = if m == 0 { 1.0 } else { 2.0 };
    dup * (2 * l + 1) as f64 / (4.0 * std::f64::consts::PI) * ratio
}

/// Inverse of the biorthogonal potential-density norm for radial order `n`
/// (zero-based) of harmonic `l`. The norm is negative: the potential and
/// density members of a bound pair have opposite signs, and this factor is
/// what makes accumulated coefficients produce attractive fields.
fn radial_norm_inv(l: usize, n: usize) -> f64 {
    let k = (4 * n * (n + 2 * l + 2) + (2 * l + 1) * (2 * l + 3)) as f64;
    let mut f = 1.0; // (n + 2l + 1)! / n!
    for i in (n + 1)..=(n + 2 * l + 1) {
        f *= i as f64;
    }
    let mut lfact = 1.0;
    for i in 1..=l {
        lfact *= i as f64;
    }
    f /= (n + l + 1) as f64 * lfact * lfact;
    let norm = -k * f / 2f64.powi(4 * l as i32 + 6);
    1.0 / norm
}

/// Spherical-harmonic force basis.
pub struct SphericalBasis {
    cfg: SphericalConfig,
    table: RadialTable,
    norms: Vec<f64>,
    rnorm: Vec<f64>,
    center: [f64; 3],
    ms: MultistepTables,
    total: CoeffTable,
    parts: Vec<CoeffTable>,
    part_mass: Vec<f64>,
    global_mass: f64,
}

impl SphericalBasis {
    /// Build the basis, tabulating the radial functions up front.
    pub fn new(cfg: SphericalConfig) -> Self {
        let rows = cfg.rows();
        let table = RadialTable::build(cfg.lmax, cfg.nmax, cfg.rmax, cfg.scale, cfg.numr);
        let mut norms = vec![0.0; rows];
        for l in 0..=cfg.lmax {
            for m in 0..=l {
                norms[lm_row(l, m)] = norm_factor(l, m);
            }
        }
        let mut rnorm = vec![0.0; (cfg.lmax + 1) * cfg.nmax];
        for l in 0..=cfg.lmax {
            for n in 0..cfg.nmax {
                rnorm[l * cfg.nmax + n] = radial_norm_inv(l, n);
            }
        }
        let samp_t = if cfg.pca.enabled() { cfg.pca.samp_t } else { 0 };
        Self {
            ms: MultistepTables::new(cfg.max_level, rows, cfg.nmax),
            total: CoeffTable::new(rows, cfg.nmax),
            parts: (0..samp_t)
                .map(|_| CoeffTable::new(rows, cfg.nmax))
                .collect(),
            part_mass: vec![0.0; samp_t],
            table,
            norms,
            rnorm,
            center: [0.0; 3],
            global_mass: 0.0,
            cfg,
        }
    }

    /// Reduced total table (valid only after `compute_coefficients`).
    pub fn coefficients(&self) -> &CoeffTable {
        &self.total
    }

    /// Globally reduced accumulated mass.
    pub fn global_mass(&self) -> f64 {
        self.global_mass
    }

    /// Add (or with negative `mass`, remove) one particle's contribution.
    fn accumulate_particle(&self, into: &mut CoeffTable, mass: f64, pos: [f64; 3]) {
        let dx = pos[0] - self.center[0];
        let dy = pos[1] - self.center[1];
        let dz = pos[2] - self.center[2];
        let r = (dx * dx + dy * dy + dz * dz).sqrt().max(RSOFT);
        let costh = (dz / r).clamp(-1.0, 1.0);
        let phi = dy.atan2(dx);

        let rows = self.cfg.rows();
        let mut plm = vec![0.0; rows];
        let mut dplm = vec![0.0; rows];
        legendre(self.cfg.lmax, costh, &mut plm, &mut dplm);

        for l in 0..=self.cfg.lmax {
            for m in 0..=l {
                let row = lm_row(l, m);
                let ang = mass * self.norms[row] * plm[row];
                let (smp, cmp) = (m as f64 * phi).sin_cos();
                for n in 0..self.cfg.nmax {
                    let v = self.table.value(l, n, r) * self.rnorm[l * self.cfg.nmax + n];
                    into.accumulate(row, n, ang * v * cmp, ang * v * smp);
                }
            }
        }
    }

    /// Potential and acceleration of the current expansion at an offset
    /// from the center.
    fn eval_offset(&self, dx: f64, dy: f64, dz: f64) -> (f64, [f64; 3]) {
        let r = (dx * dx + dy * dy + dz * dz).sqrt().max(RSOFT);
        let costh = (dz / r).clamp(-1.0, 1.0);
        let sinth = (1.0 - costh * costh).max(0.0).sqrt();
        let phi = dy.atan2(dx);

        let rows = self.cfg.rows();
        let mut plm = vec![0.0; rows];
        let mut dplm = vec![0.0; rows];
        legendre(self.cfg.lmax, costh, &mut plm, &mut dplm);

        let mut pot = 0.0;
        let mut dpot_dr = 0.0;
        let mut dpot_dth = 0.0;
        let mut dpot_dphi = 0.0;

        for l in 0..=self.cfg.lmax {
            for m in 0..=l {
                let row = lm_row(l, m);
                let (smp, cmp) = (m as f64 * phi).sin_cos();
                for n in 0..self.cfg.nmax {
                    let k = self.total.idx(row, n);
                    let c = self.total.cos[k];
                    let s = self.total.sin[k];
                    let azim = c * cmp + s * smp;
                    let v = self.table.value(l, n, r);
                    let dv = self.table.deriv(l, n, r);
                    pot += azim * plm[row] * v;
                    dpot_dr += azim * plm[row] * dv;
                    dpot_dth += azim * dplm[row] * v;
                    dpot_dphi += m as f64 * (s * cmp - c * smp) * plm[row] * v;
                }
            }
        }

        let f_r = -dpot_dr;
        let f_th = -dpot_dth / r;
        let f_phi = -dpot_dphi / (r * sinth.max(SINTH_MIN));

        let (sinp, cosp) = phi.sin_cos();
        let acc = [
            f_r * sinth * cosp + f_th * costh * cosp - f_phi * sinp,
            f_r * sinth * sinp + f_th * costh * sinp + f_phi * cosp,
            f_r * costh - f_th * sinth,
        ];
        (pot, acc)
    }
}

impl ForceBasis for SphericalBasis {
    fn compute_coefficients(
        &mut self,
        set: &ParticleSet,
        levels: &LevelLists,
        mlevel: usize,
        comm: &dyn Collective,
    ) {
        let rows = self.cfg.rows();
        let nmax = self.cfg.nmax;
        let full_pass = mlevel == 0;
        let samp_t = self.parts.len();

        let low = mlevel.min(self.ms.max_level());
        self.ms.zero_from(low);
        if full_pass && samp_t > 0 {
            for p in self.parts.iter_mut() {
                p.zero();
            }
            self.part_mass.fill(0.0);
        }

        for lev in low..=levels.max_level().min(self.ms.max_level()) {
            let idxs = levels.at(lev);
            let ranges = chunk_ranges(idxs.len(), self.cfg.threads);

            // Thread-local partials, merged after join.
            type Chunk = (CoeffTable, u64, f64, Vec<(CoeffTable, f64)>);
            let this = &*self;
            let results: Vec<Chunk> = thread::scope(|s| {
                let handles: Vec<_> = ranges
                    .iter()
                    .map(|&(beg, end)| {
                        s.spawn(move || {
                            let mut local = CoeffTable::new(rows, nmax);
                            let mut used = 0u64;
                            let mut mass = 0.0;
                            let mut parts: Vec<(CoeffTable, f64)> = (0..samp_t)
                                .map(|_| (CoeffTable::new(rows, nmax), 0.0))
                                .collect();
                            for &i in &idxs[beg..end] {
                                if set.frozen[i] {
                                    continue;
                                }
                                let m = set.mass[i];
                                this.accumulate_particle(&mut local, m, set.position(i));
                                used += 1;
                                mass += m;
                                if full_pass && samp_t > 0 {
                                    let part = &mut parts[i % samp_t];
                                    this.accumulate_particle(&mut part.0, m, set.position(i));
                                    part.1 += m;
                                }
                            }
                            (local, used, mass, parts)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("accumulation thread panicked"))
                    .collect()
            });

            for (local, used, mass, parts) in results {
                self.ms.level_mut(lev).add_from(&local);
                self.ms.used[lev] += used;
                self.ms.mass[lev] += mass;
                for (sidx, (table, pmass)) in parts.into_iter().enumerate() {
                    self.parts[sidx].add_from(&table);
                    self.part_mass[sidx] += pmass;
                }
            }
        }

        // Reduce the total across workers: every worker ends up with the
        // identical authoritative table.
        self.ms.total_into(&mut self.total);
        let size = rows * nmax;
        let mut buf = vec![0.0; 2 * size + 1];
        buf[..size].copy_from_slice(&self.total.cos);
        buf[size..2 * size].copy_from_slice(&self.total.sin);
        buf[2 * size] = self.ms.total_mass();
        comm.allreduce_sum(&mut buf);
        self.total.cos.copy_from_slice(&buf[..size]);
        self.total.sin.copy_from_slice(&buf[size..2 * size]);
        self.global_mass = buf[2 * size];

        if full_pass && samp_t > 0 {
            let mut pbuf = vec![0.0; samp_t * (2 * size + 1)];
            for (sidx, p) in self.parts.iter().enumerate() {
                let base = sidx * (2 * size + 1);
                pbuf[base..base + size].copy_from_slice(&p.cos);
                pbuf[base + size..base + 2 * size].copy_from_slice(&p.sin);
                pbuf[base + 2 * size] = self.part_mass[sidx];
            }
            comm.allreduce_sum(&mut pbuf);
            for (sidx, p) in self.parts.iter_mut().enumerate() {
                let base = sidx * (2 * size + 1);
                p.cos.copy_from_slice(&pbuf[base..base + size]);
                p.sin.copy_from_slice(&pbuf[base + size..base + 2 * size]);
                self.part_mass[sidx] = pbuf[base + 2 * size];
            }
            pca::shrink(&mut self.total, &self.parts, &self.part_mass, &self.cfg.pca);
        }

        self.total.valid = true;
        tracing::debug!(
            "spherical coefficients reduced: mlevel={} mass={:.6} used={}",
            mlevel,
            self.global_mass,
            self.ms.total_used()
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
        let mass = set.mass[idx];
        let pos = set.position(idx);
        let rows = self.cfg.rows();
        let nmax = self.cfg.nmax;
        let mut delta = CoeffTable::new(rows, nmax);
        self.accumulate_particle(&mut delta, mass, pos);
        self.ms.pending_mut(from).sub_from(&delta);
        self.ms.pending_mut(to).add_from(&delta);
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
        crate::dump_table("spherical", &self.total, out)
    }
}
