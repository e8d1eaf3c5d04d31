//! With the acceleration correction enabled, the mass-weighted net force
//! over all components must vanish after every pass.

use std::sync::Arc;

use basis::{ParticleSet, SoloCollective};
use orchestrator::component::{build_basis, Component};
use orchestrator::config::Params;
use orchestrator::{ComponentContainer, ContainerSettings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn random_component(name: &str, id: &str, params: &str, n: usize, seed: u64) -> Component {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut set = ParticleSet::new();
    for _ in 0..n {
        set.push_particle(
            rng.gen_range(0.5..1.5),
            [
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-0.5..0.5),
            ],
            [
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.1..0.1),
            ],
        );
    }
    let basis = build_basis(id, &Params::parse(params).unwrap(), 2, 0).unwrap();
    Component::new(name, id, set, basis, 0, true, 1)
}

fn net_momentum_flux(system: &ComponentContainer) -> [f64; 3] {
    let mut net = [0.0f64; 3];
    for c in &system.components {
        for i in 0..c.particles.len() {
            let m = c.particles.mass[i];
            net[0] += m * c.particles.ax[i];
            net[1] += m * c.particles.ay[i];
            net[2] += m * c.particles.az[i];
        }
    }
    net
}

#[test]
fn two_component_system_conserves_momentum() {
    init_logging();
    let halo = random_component("halo", "sphere", "lmax=2 nmax=4 numr=200", 120, 11);
    let disk = random_component(
        "disk",
        "cylinder",
        "mmax=2 norder=4 acyl=1.0 hcyl=0.2 rcylfac=5.0 zcylfac=10.0 ncylnx=32 ncylnz=17",
        80,
        12,
    );

    // Mutual interaction both ways plus self-gravity.
    let mut system = ComponentContainer::new(
        vec![halo, disk],
        vec![(0, 1), (1, 0)],
        Arc::new(SoloCollective),
        ContainerSettings {
            zero_com_accel: true,
            ..ContainerSettings::default()
        },
    );

    system.compute_potential(0);
    let net = net_momentum_flux(&system);
    let mtot: f64 = system
        .components
        .iter()
        .map(|c| c.particles.mass.iter().sum::<f64>())
        .sum();
    for v in net {
        assert!(
            v.abs() < 1e-9 * mtot,
            "net momentum flux not cancelled: {:?}",
            net
        );
    }
}

#[test]
fn frozen_particles_are_left_out_of_the_correction() {
    init_logging();
    let mut comp = random_component("halo", "sphere", "lmax=2 nmax=4 numr=200", 30, 13);
    comp.particles.frozen[0] = true;
    let mut system = ComponentContainer::new(
        vec![comp],
        Vec::new(),
        Arc::new(SoloCollective),
        ContainerSettings {
            zero_com_accel: true,
            ..ContainerSettings::default()
        },
    );

    system.compute_potential(0);
    let c = &system.components[0];
    assert_eq!(c.particles.ax[0], 0.0);

    let mut net = [0.0f64; 3];
    for i in 1..c.particles.len() {
        let m = c.particles.mass[i];
        net[0] += m * c.particles.ax[i];
        net[1] += m * c.particles.ay[i];
        net[2] += m * c.particles.az[i];
    }
    for v in net {
        assert!(v.abs() < 1e-9);
    }
}
