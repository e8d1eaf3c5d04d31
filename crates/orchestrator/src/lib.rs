//! Orchestration layer
//!
//! This crate drives multi-component expansion runs:
//! - JSON system configuration with validation
//! - component construction from description and particle files
//! - the component container with interaction edges and external forces
//! - center-of-mass and acceleration corrections
//! - timing-driven load balancing across collective workers

#![warn(missing_docs)]

pub mod balance;
pub mod component;
pub mod config;
pub mod container;

pub use component::Component;
pub use config::SystemConfig;
pub use container::{ComponentContainer, ContainerSettings, ExternalForce};

use std::path::Path;
use std::sync::Arc;

use basis::Collective;
use config::{ComponentDescription, MasterHeader};

/// Create a complete system from a configuration file.
///
/// The full setup pipeline:
/// 1. Load and validate the configuration
/// 2. Read worker rates (homogeneous when no rate file is given)
/// 3. Read and share the restart header, if restarting
/// 4. Parse each component's description file and particle file
/// 5. Build the bases and resolve interaction edges
/// 6. Assemble the container
///
/// Every failure path names the offending file or parameter.
pub fn create_system(
    config_path: &str,
    comm: Arc<dyn Collective>,
) -> Result<ComponentContainer, String> {
    tracing::info!("creating system from config: {}", config_path);

    let config = SystemConfig::load(config_path)?;
    tracing::info!("configuration loaded: {}", config.name);

    let rates = config::read_rates(config.rate_file.as_deref(), comm.size())?;

    // Paths in the config resolve relative to the config file itself.
    let config_dir = Path::new(config_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let resolve = |p: &str| -> String {
        let path = Path::new(p);
        if path.is_absolute() {
            p.to_string()
        } else {
            config_dir.join(path).to_string_lossy().into_owned()
        }
    };

    let mut tnow = 0.0;
    if let Some(restart) = config.restart_file.as_deref() {
        // Rank 0 reads the header; everyone gets the same copy.
        let header = if comm.rank() == 0 {
            Some(MasterHeader::read(&resolve(restart))?)
        } else {
            None
        };
        let header = MasterHeader::exchange(header, &*comm);
        if header.ncomp as usize != config.components.len() {
            return Err(format!(
                "Restart file {} has {} components, config names {}",
                restart,
                header.ncomp,
                config.components.len()
            ));
        }
        tnow = header.time;
        tracing::info!(
            "restarting at t={} ({} particles, {} components)",
            header.time,
            header.ntot,
            header.ncomp
        );
    }

    let mut components = Vec::with_capacity(config.components.len());
    for entry in &config.components {
        let desc_path = resolve(&entry.description_file);
        let mut desc = ComponentDescription::load(&desc_path)?;
        desc.particle_file = resolve(&desc.particle_file);
        components.push(Component::from_description(
            &entry.name,
            &desc,
            config.multistep,
            config.threads,
            comm.size(),
        )?);
    }

    let index_of = |name: &str| -> Result<usize, String> {
        components
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| format!("Interaction names unknown component {}", name))
    };
    let mut interactions = Vec::with_capacity(config.interactions.len());
    for edge in &config.interactions {
        let s = index_of(&edge.source)?;
        let t = index_of(&edge.target)?;
        tracing::info!("{} acts on {}", components[s].name, components[t].name);
        interactions.push((s, t));
    }

    let mut container = ComponentContainer::new(
        components,
        interactions,
        comm,
        ContainerSettings {
            nbalance: config.nbalance,
            dbthresh: config.dbthresh,
            zero_com_accel: config.zero_com_accel,
        },
    );
    container.set_rates(rates);
    container.tnow = tnow;

    tracing::info!("system ready: {} components", container.components.len());
    Ok(container)
}

/// Collective wrapper around [`create_system`]: a setup failure takes all
/// workers down together instead of leaving them divergent at a barrier.
pub fn create_system_collective(
    config_path: &str,
    comm: Arc<dyn Collective>,
) -> ComponentContainer {
    match create_system(config_path, Arc::clone(&comm)) {
        Ok(container) => container,
        Err(e) => comm.abort(255, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basis::SoloCollective;
    use std::fs;
    use std::io::Write;

    fn write_fixture(dir: &Path) -> String {
        let bods = dir.join("halo.bods");
        let mut f = fs::File::create(&bods).unwrap();
        for i in 0..20 {
            let x = -1.0 + 0.1 * i as f64;
            writeln!(f, "1.0 {} {} 0.0 0.0 0.0 0.0", x, 0.5 * x).unwrap();
        }
        drop(f);

        fs::write(
            dir.join("halo.desc"),
            "sphere : lmax=2 nmax=4 numr=100 : halo.bods : com=true\n",
        )
        .unwrap();

        let config = dir.join("system.json");
        fs::write(
            &config,
            r#"{
                "name": "one component",
                "components": [
                    {"name": "halo", "description_file": "halo.desc"}
                ],
                "multistep": 1,
                "threads": 2,
                "zero_com_accel": true
            }"#,
        )
        .unwrap();
        config.to_string_lossy().into_owned()
    }

    #[test]
    fn create_system_from_files() {
        let dir = std::env::temp_dir().join("scf_create_system_test");
        fs::create_dir_all(&dir).unwrap();
        let config_path = write_fixture(&dir);

        let mut system = create_system(&config_path, Arc::new(SoloCollective)).unwrap();
        assert_eq!(system.components.len(), 1);
        assert_eq!(system.components[0].particles.len(), 20);

        system.compute_potential(0);
        assert!(system.components[0].particles.pot.iter().any(|&p| p != 0.0));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn create_system_reports_missing_description() {
        let dir = std::env::temp_dir().join("scf_create_system_missing");
        fs::create_dir_all(&dir).unwrap();
        let config = dir.join("system.json");
        fs::write(
            &config,
            r#"{
                "name": "broken",
                "components": [
                    {"name": "halo", "description_file": "absent.desc"}
                ]
            }"#,
        )
        .unwrap();

        let err = create_system(config.to_str().unwrap(), Arc::new(SoloCollective))
            .err()
            .unwrap();
        assert!(err.contains("absent.desc"), "error was: {}", err);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn restart_header_mismatch_is_fatal() {
        let dir = std::env::temp_dir().join("scf_create_system_restart");
        fs::create_dir_all(&dir).unwrap();
        let config_path = write_fixture(&dir);

        // Header claims two components; the config names one.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4.5f64.to_le_bytes());
        bytes.extend_from_slice(&20u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        fs::write(dir.join("restart.bin"), &bytes).unwrap();

        let contents = fs::read_to_string(&config_path).unwrap();
        let patched = contents.replace(
            "\"multistep\"",
            "\"restart_file\": \"restart.bin\", \"multistep\"",
        );
        fs::write(&config_path, patched).unwrap();

        assert!(create_system(&config_path, Arc::new(SoloCollective)).is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
