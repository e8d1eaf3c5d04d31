//! The component container: owns every component, drives the force
//! passes, applies interaction edges and external forces, and runs the
//! load balancer.

use std::sync::Arc;

use basis::{Collective, FieldMode};

use crate::balance::{derive_rates, needs_rebalance, WorkTimer};
use crate::component::Component;

/// An externally imposed field (a perturber, a fixed background) applied
/// to every component after the interaction edges.
pub trait ExternalForce: Send {
    /// Name for the setup log.
    fn name(&self) -> &str;

    /// Potential and acceleration at a world position and time.
    fn field_at(&self, pos: [f64; 3], time: f64) -> (f64, [f64; 3]);
}

/// Container-level knobs from the system configuration.
#[derive(Debug, Clone, Copy)]
pub struct ContainerSettings {
    /// Load-balance interval in steps; 0 disables balancing.
    pub nbalance: usize,
    /// Relative rate deviation required to repartition.
    pub dbthresh: f64,
    /// Subtract the mass-weighted mean acceleration each force pass.
    pub zero_com_accel: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            nbalance: 0,
            dbthresh: 0.05,
            zero_com_accel: false,
        }
    }
}

/// All components of the system plus the machinery that couples them.
pub struct ComponentContainer {
    /// The components, in configuration order.
    pub components: Vec<Component>,
    /// Directed interaction edges as `(source, target)` component indices.
    pub interactions: Vec<(usize, usize)>,
    external: Vec<Box<dyn ExternalForce>>,
    /// Normalized per-worker processing rates.
    pub rates: Vec<f64>,
    settings: ContainerSettings,
    work_timer: WorkTimer,
    comm: Arc<dyn Collective>,
    /// Current simulation time, fed to external forces.
    pub tnow: f64,
}

/// Disjoint source/target access for an interaction edge.
fn pair_mut(comps: &mut [Component], a: usize, b: usize) -> (&Component, &mut Component) {
    assert_ne!(a, b, "interaction edges never connect a component to itself");
    if a < b {
        let (lo, hi) = comps.split_at_mut(b);
        (&lo[a], &mut hi[0])
    } else {
        let (lo, hi) = comps.split_at_mut(a);
        (&hi[0], &mut lo[b])
    }
}

impl ComponentContainer {
    /// Assemble a container. Worker rates start homogeneous; the load
    /// balancer adjusts them from measured timings.
    pub fn new(
        components: Vec<Component>,
        interactions: Vec<(usize, usize)>,
        comm: Arc<dyn Collective>,
        settings: ContainerSettings,
    ) -> Self {
        let size = comm.size();
        Self {
            components,
            interactions,
            external: Vec::new(),
            rates: vec![1.0 / size as f64; size],
            settings,
            work_timer: WorkTimer::default(),
            comm,
            tnow: 0.0,
        }
    }

    /// Register an external force, applied after all interaction edges.
    pub fn add_external(&mut self, force: Box<dyn ExternalForce>) {
        tracing::info!("external force registered: {}", force.name());
        self.external.push(force);
    }

    /// Override the initial worker rates (from a rate file).
    pub fn set_rates(&mut self, rates: Vec<f64>) {
        for c in &mut self.components {
            c.load_balance(&rates);
        }
        self.rates = rates;
    }

    /// Full force pass for particles at levels `mlevel..=max`: recenter,
    /// zero fields, self-gravity per component under the work timer, then
    /// interaction edges, external forces, and the optional acceleration
    /// correction.
    pub fn compute_potential(&mut self, mlevel: usize) {
        for c in &mut self.components {
            c.fix_positions(&*self.comm);
        }
        for c in &mut self.components {
            c.zero_fields(mlevel);
        }

        self.work_timer.start();
        for c in &mut self.components {
            c.compute_coefficients(mlevel, &*self.comm);
            c.apply_self_field(mlevel);
        }
        self.work_timer.stop();

        for k in 0..self.interactions.len() {
            let (s, t) = self.interactions[k];
            let (src, tgt) = pair_mut(&mut self.components, s, t);
            let Component {
                particles, levels, ..
            } = tgt;
            src.basis
                .apply_field(particles, levels, mlevel, FieldMode::External);
        }

        for force in &self.external {
            for c in &mut self.components {
                for lev in mlevel..=c.levels.max_level() {
                    for &i in c.levels.at(lev) {
                        if c.particles.frozen[i] {
                            continue;
                        }
                        let (pot, acc) = force.field_at(c.particles.position(i), self.tnow);
                        c.particles.potext[i] += pot;
                        c.particles.ax[i] += acc[0];
                        c.particles.ay[i] += acc[1];
                        c.particles.az[i] += acc[2];
                    }
                }
            }
        }

        if self.settings.zero_com_accel {
            self.fix_acceleration();
        }
    }

    /// Coefficient accumulation only, no force evaluation.
    pub fn compute_expansion(&mut self, mlevel: usize) {
        for c in &mut self.components {
            c.fix_positions(&*self.comm);
        }
        for c in &mut self.components {
            c.compute_coefficients(mlevel, &*self.comm);
        }
    }

    /// Subtract the global mass-weighted mean acceleration from every
    /// unfrozen particle, pinning the system's center of mass.
    pub fn fix_acceleration(&mut self) {
        let mut buf = [0.0f64; 4];
        for c in &self.components {
            for i in 0..c.particles.len() {
                if c.particles.frozen[i] {
                    continue;
                }
                let m = c.particles.mass[i];
                buf[0] += m;
                buf[1] += m * c.particles.ax[i];
                buf[2] += m * c.particles.ay[i];
                buf[3] += m * c.particles.az[i];
            }
        }
        self.comm.allreduce_sum(&mut buf);
        if buf[0] <= 0.0 {
            return;
        }
        let mean = [buf[1] / buf[0], buf[2] / buf[0], buf[3] / buf[0]];

        for c in &mut self.components {
            for i in 0..c.particles.len() {
                if c.particles.frozen[i] {
                    continue;
                }
                c.particles.ax[i] -= mean[0];
                c.particles.ay[i] -= mean[1];
                c.particles.az[i] -= mean[2];
            }
        }
    }

    /// Commit buffered level-change deltas in every basis.
    pub fn multistep_swap(&mut self, m: usize) {
        for c in &mut self.components {
            c.basis.multistep_swap(m);
        }
    }

    /// Reset per-level counters in every basis.
    pub fn multistep_reset(&mut self) {
        for c in &mut self.components {
            c.basis.multistep_reset();
        }
    }

    /// Balancing hook, called once per step. Fires only on multiples of
    /// `nbalance`; exchanges accumulated work timings and repartitions when
    /// the derived rates have drifted. Returns whether a repartition ran.
    pub fn load_balance(&mut self, step: u64) -> bool {
        if self.settings.nbalance == 0 || step == 0 || step % self.settings.nbalance as u64 != 0
        {
            return false;
        }
        let mut timings = vec![0.0; self.comm.size()];
        timings[self.comm.rank()] = self.work_timer.seconds();
        self.comm.allreduce_sum(&mut timings);
        self.work_timer.reset();
        self.load_balance_from_timing(&timings)
    }

    /// Rate derivation and hysteresis test, split out from the collective
    /// exchange so it can run on recorded timings.
    pub fn load_balance_from_timing(&mut self, timings: &[f64]) -> bool {
        let fresh = derive_rates(timings);
        if !needs_rebalance(&self.rates, &fresh, self.settings.dbthresh) {
            tracing::debug!("load balance: rates within threshold, keeping partition");
            return false;
        }
        tracing::info!(
            "load balance: repartitioning, rates {:?} -> {:?}",
            self.rates,
            fresh
        );
        for c in &mut self.components {
            c.load_balance(&fresh);
        }
        self.rates = fresh;
        true
    }
}
