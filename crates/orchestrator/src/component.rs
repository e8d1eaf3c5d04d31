//! A component: one particle population bound to one force basis.

use basis::cylinder::{CylinderBasis, CylinderConfig};
use basis::pca::{PcaConfig, Shrinkage};
use basis::spherical::{SphericalBasis, SphericalConfig};
use basis::tables::CylParams;
use basis::{Collective, FieldMode, ForceBasis, LevelLists, ParticleSet};

use crate::config::{ComponentDescription, Params};

/// One self-gravitating particle population and its expansion.
pub struct Component {
    /// Component name from the configuration.
    pub name: String,
    /// Basis identifier this component was built with.
    pub id: String,
    /// The particles this worker owns.
    pub particles: ParticleSet,
    /// Per-level index lists.
    pub levels: LevelLists,
    /// The force solver.
    pub basis: Box<dyn ForceBasis>,
    /// Globally reduced center of mass.
    pub com: [f64; 3],
    /// Globally reduced center-of-mass velocity.
    pub cov: [f64; 3],
    /// Globally reduced total (unfrozen) mass.
    pub mtot: f64,
    /// Recenter the expansion on the center of mass each pass.
    pub com_system: bool,
    /// Per-rank index partition `[begin, end)` from the load balancer.
    ///
    /// This crate only maintains the record; the particle-exchange step
    /// that migrates bodies between workers lives in the driving
    /// application and reads its send/receive ranges from here after each
    /// repartition.
    pub bounds: Vec<(usize, usize)>,
}

impl Component {
    /// Assemble a component around an existing particle set and basis.
    pub fn new(
        name: &str,
        id: &str,
        particles: ParticleSet,
        basis: Box<dyn ForceBasis>,
        max_level: usize,
        com_system: bool,
        nranks: usize,
    ) -> Self {
        let levels = LevelLists::build(&particles, max_level);
        let mut c = Self {
            name: name.to_string(),
            id: id.to_string(),
            particles,
            levels,
            basis,
            com: [0.0; 3],
            cov: [0.0; 3],
            mtot: 0.0,
            com_system,
            bounds: Vec::new(),
        };
        c.load_balance(&vec![1.0 / nranks as f64; nranks]);
        c
    }

    /// Build a component from a parsed description file.
    pub fn from_description(
        name: &str,
        desc: &ComponentDescription,
        max_level: usize,
        threads: usize,
        nranks: usize,
    ) -> Result<Self, String> {
        let particles = ParticleSet::read_text(&desc.particle_file)?;
        let basis = build_basis(&desc.id, &desc.basis_params, threads, max_level)?;
        let com_system = desc.runtime_params.get_bool("com", false)?;
        tracing::info!(
            "component {}: {} particles, {} basis",
            name,
            particles.len(),
            desc.id
        );
        Ok(Self::new(
            name, &desc.id, particles, basis, max_level, com_system, nranks,
        ))
    }

    /// Recompute the global center of mass and velocity over unfrozen
    /// particles and, for `com_system` components, recenter the expansion.
    pub fn fix_positions(&mut self, comm: &dyn Collective) {
        let mut buf = [0.0f64; 7];
        for i in 0..self.particles.len() {
            if self.particles.frozen[i] {
                continue;
            }
            let m = self.particles.mass[i];
            buf[0] += m;
            buf[1] += m * self.particles.x[i];
            buf[2] += m * self.particles.y[i];
            buf[3] += m * self.particles.z[i];
            buf[4] += m * self.particles.vx[i];
            buf[5] += m * self.particles.vy[i];
            buf[6] += m * self.particles.vz[i];
        }
        comm.allreduce_sum(&mut buf);

        self.mtot = buf[0];
        if self.mtot > 0.0 {
            self.com = [buf[1] / buf[0], buf[2] / buf[0], buf[3] / buf[0]];
            self.cov = [buf[4] / buf[0], buf[5] / buf[0], buf[6] / buf[0]];
        }
        if self.com_system {
            self.basis.set_center(self.com);
        }
    }

    /// Move particle `idx` to level `to`, keeping the basis's multistep
    /// bookkeeping in step with the level lists.
    pub fn set_level(&mut self, idx: usize, to: usize) {
        let from = self.particles.level[idx];
        if from == to {
            return;
        }
        self.basis.multistep_update(from, to, &self.particles, idx);
        self.levels.assign(&mut self.particles, idx, to);
    }

    /// Zero accumulated fields for particles at levels `mlevel..=max`.
    pub fn zero_fields(&mut self, mlevel: usize) {
        for lev in mlevel..=self.levels.max_level() {
            for &i in self.levels.at(lev) {
                self.particles.ax[i] = 0.0;
                self.particles.ay[i] = 0.0;
                self.particles.az[i] = 0.0;
                self.particles.pot[i] = 0.0;
                self.particles.potext[i] = 0.0;
            }
        }
    }

    /// Accumulate this component's coefficients (collective call).
    pub fn compute_coefficients(&mut self, mlevel: usize, comm: &dyn Collective) {
        self.basis
            .compute_coefficients(&self.particles, &self.levels, mlevel, comm);
    }

    /// Evaluate the component's own field on its own particles.
    pub fn apply_self_field(&mut self, mlevel: usize) {
        self.basis
            .apply_field(&mut self.particles, &self.levels, mlevel, FieldMode::SelfField);
    }

    /// Recompute per-rank index boundaries from a cumulative rate vector:
    /// rank `r` owns `[floor(N * c_{r-1}), floor(N * c_r))`.
    pub fn load_balance(&mut self, rates: &[f64]) {
        let n = self.particles.len();
        let mut bounds = Vec::with_capacity(rates.len());
        let mut cum = 0.0;
        let mut beg = 0usize;
        for (r, &rate) in rates.iter().enumerate() {
            cum += rate;
            let end = if r + 1 == rates.len() {
                n
            } else {
                ((n as f64 * cum).floor() as usize).min(n)
            };
            bounds.push((beg, end));
            beg = end;
        }
        self.bounds = bounds;
    }

    /// Total angular momentum about the center of mass, in the
    /// center-of-mass velocity frame.
    pub fn angular_momentum(&self) -> [f64; 3] {
        let mut l = [0.0f64; 3];
        for i in 0..self.particles.len() {
            if self.particles.frozen[i] {
                continue;
            }
            let m = self.particles.mass[i];
            let r = [
                self.particles.x[i] - self.com[0],
                self.particles.y[i] - self.com[1],
                self.particles.z[i] - self.com[2],
            ];
            let v = [
                self.particles.vx[i] - self.cov[0],
                self.particles.vy[i] - self.cov[1],
                self.particles.vz[i] - self.cov[2],
            ];
            l[0] += m * (r[1] * v[2] - r[2] * v[1]);
            l[1] += m * (r[2] * v[0] - r[0] * v[2]);
            l[2] += m * (r[0] * v[1] - r[1] * v[0]);
        }
        l
    }
}

/// Construct a basis from its description-file identifier and parameters.
pub fn build_basis(
    id: &str,
    params: &Params,
    threads: usize,
    max_level: usize,
) -> Result<Box<dyn ForceBasis>, String> {
    match id {
        "sphere" => {
            let samp_t = params.get_usize("pcasamp", 0)?;
            let kind = match params.get_str("pcakind", "hall").as_str() {
                "hall" => Shrinkage::Hall,
                "varcut" => Shrinkage::VarianceCut,
                "cumcut" => Shrinkage::CumulativeCut,
                "varweight" => Shrinkage::VarianceWeighted,
                "null" => Shrinkage::Null,
                other => return Err(format!("Unknown pcakind {:?}", other)),
            };
            let cfg = SphericalConfig {
                lmax: params.get_usize("lmax", 4)?,
                nmax: params.get_usize("nmax", 10)?,
                rmax: params.get_f64("rmax", 20.0)?,
                scale: params.get_f64("rscale", 1.0)?,
                numr: params.get_usize("numr", 1000)?,
                threads,
                max_level,
                pca: PcaConfig {
                    samp_t,
                    kind,
                    smooth: params.get_f64("pcasmooth", 1.0)?,
                    cum: params.get_f64("pcacum", 1.0)?,
                },
            };
            if cfg.nmax == 0 || cfg.rmax <= 0.0 || cfg.scale <= 0.0 {
                return Err("sphere basis needs nmax >= 1, rmax > 0, rscale > 0".to_string());
            }
            Ok(Box::new(SphericalBasis::new(cfg)))
        }
        "cylinder" => {
            let cfg = CylinderConfig {
                params: CylParams {
                    mmax: params.get_usize("mmax", 6)?,
                    norder: params.get_usize("norder", 8)?,
                    ascale: params.get_f64("acyl", 1.0)?,
                    hscale: params.get_f64("hcyl", 0.1)?,
                    rfac: params.get_f64("rcylfac", 20.0)?,
                    zfac: params.get_f64("zcylfac", 40.0)?,
                    nx: params.get_usize("ncylnx", 128)?,
                    nz: params.get_usize("ncylnz", 65)?,
                },
                threads,
                max_level,
                nrecomp: params.get_usize("nrecomp", 0)?,
                self_consistent: params.get_bool("selfcons", true)?,
                cache_file: params.get_opt("cachefile").map(str::to_string),
            };
            if cfg.params.norder == 0 || cfg.params.ascale <= 0.0 || cfg.params.hscale <= 0.0 {
                return Err(
                    "cylinder basis needs norder >= 1, acyl > 0, hcyl > 0".to_string()
                );
            }
            Ok(Box::new(CylinderBasis::new(cfg)))
        }
        other => Err(format!("Unknown basis id {:?}", other)),
    }
}
