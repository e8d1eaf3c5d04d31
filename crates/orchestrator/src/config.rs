//! Configuration parsing and validation for multi-component runs.

use std::collections::HashMap;
use std::fs;
use std::io::Read;

use basis::Collective;
use serde::{Deserialize, Serialize};

/// Main system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Human-readable run name.
    pub name: String,
    /// Components in the system, each built from a description file.
    pub components: Vec<ComponentEntry>,
    /// Directed interaction edges: `source`'s field acts on `target`.
    #[serde(default)]
    pub interactions: Vec<InteractionEntry>,
    /// Per-worker relative processing rates; missing means homogeneous.
    #[serde(default)]
    pub rate_file: Option<String>,
    /// Restart header to resume from.
    #[serde(default)]
    pub restart_file: Option<String>,
    /// Highest multistep level.
    #[serde(default)]
    pub multistep: usize,
    /// Accumulation/evaluation threads per worker.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Load-balance interval in steps; 0 disables balancing.
    #[serde(default)]
    pub nbalance: usize,
    /// Relative rate deviation required to trigger repartitioning.
    #[serde(default = "default_dbthresh")]
    pub dbthresh: f64,
    /// Subtract the mass-weighted mean acceleration each force pass.
    #[serde(default)]
    pub zero_com_accel: bool,
}

/// One component in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentEntry {
    /// Component name, referenced by interaction edges.
    pub name: String,
    /// Path to the component's description file.
    pub description_file: String,
}

/// One directed interaction edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEntry {
    /// Component whose field acts.
    pub source: String,
    /// Component whose particles receive the field.
    pub target: String,
}

fn default_threads() -> usize {
    1
}

fn default_dbthresh() -> f64 {
    0.05
}

impl SystemConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        let config: SystemConfig = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse config JSON: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.components.is_empty() {
            return Err("At least one component is required".to_string());
        }

        let mut names: Vec<&str> = Vec::new();
        for c in &self.components {
            if names.contains(&c.name.as_str()) {
                return Err(format!("Duplicate component name: {}", c.name));
            }
            names.push(&c.name);
        }

        for edge in &self.interactions {
            if !names.contains(&edge.source.as_str()) {
                return Err(format!("Interaction source {} is not a component", edge.source));
            }
            if !names.contains(&edge.target.as_str()) {
                return Err(format!("Interaction target {} is not a component", edge.target));
            }
            if edge.source == edge.target {
                return Err(format!("Component {} cannot act on itself", edge.source));
            }
        }

        if self.threads == 0 {
            return Err("threads must be at least 1".to_string());
        }
        if self.multistep > 16 {
            return Err("multistep must be at most 16".to_string());
        }
        if self.dbthresh <= 0.0 {
            return Err("dbthresh must be positive".to_string());
        }

        Ok(())
    }
}

/// A small `key=value` parameter map, the payload of description-file
/// fields. Values stay strings until a typed getter asks for them, so a
/// bad value is reported with its key.
#[derive(Debug, Clone, Default)]
pub struct Params {
    map: HashMap<String, String>,
}

impl Params {
    /// Parse a space-separated `key=value` list.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut map = HashMap::new();
        for tok in text.split_whitespace() {
            let (key, value) = tok
                .split_once('=')
                .ok_or_else(|| format!("Bad parameter token {:?} (expected key=value)", tok))?;
            if key.is_empty() {
                return Err(format!("Bad parameter token {:?} (empty key)", tok));
            }
            map.insert(key.to_string(), value.to_string());
        }
        Ok(Self { map })
    }

    /// String value, or `default` when absent.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.map.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    /// Optional string value.
    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    /// Float value, or `default` when absent.
    pub fn get_f64(&self, key: &str, default: f64) -> Result<f64, String> {
        match self.map.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|e| format!("Parameter {}={:?} is not a float: {}", key, v, e)),
        }
    }

    /// Integer value, or `default` when absent.
    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize, String> {
        match self.map.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|e| format!("Parameter {}={:?} is not an integer: {}", key, v, e)),
        }
    }

    /// Boolean value (`true`/`false`/`1`/`0`), or `default` when absent.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.map.get(key).map(|s| s.as_str()) {
            None => Ok(default),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(v) => Err(format!("Parameter {}={:?} is not a boolean", key, v)),
        }
    }
}

/// A parsed component description: the single colon-delimited line
/// `id : basis-params : particle-file : runtime-params`.
#[derive(Debug, Clone)]
pub struct ComponentDescription {
    /// Basis identifier (`sphere` or `cylinder`).
    pub id: String,
    /// Parameters for the basis.
    pub basis_params: Params,
    /// Path to the plain-text particle file.
    pub particle_file: String,
    /// Runtime parameters for the component itself.
    pub runtime_params: Params,
}

impl ComponentDescription {
    /// Parse a description file: the first non-blank, non-comment line.
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read description file {}: {}", path, e))?;

        let line = contents
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or_else(|| format!("Description file {} has no content line", path))?;

        let fields: Vec<&str> = line.split(':').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(format!(
                "{}: expected 4 colon-delimited fields (id : basis-params : particle-file : runtime-params), got {}",
                path,
                fields.len()
            ));
        }
        if fields[0].is_empty() {
            return Err(format!("{}: empty basis id", path));
        }
        if fields[2].is_empty() {
            return Err(format!("{}: empty particle file", path));
        }

        Ok(Self {
            id: fields[0].to_string(),
            basis_params: Params::parse(fields[1]).map_err(|e| format!("{}: {}", path, e))?,
            particle_file: fields[2].to_string(),
            runtime_params: Params::parse(fields[3]).map_err(|e| format!("{}: {}", path, e))?,
        })
    }
}

/// Fixed restart header: simulation time and global particle/component
/// counts, little-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasterHeader {
    /// Simulation time at the checkpoint.
    pub time: f64,
    /// Total particle count across components.
    pub ntot: u32,
    /// Component count.
    pub ncomp: u32,
}

impl MasterHeader {
    /// Read the header from the front of a restart file.
    pub fn read(path: &str) -> Result<Self, String> {
        let mut file = fs::File::open(path)
            .map_err(|e| format!("Failed to open restart file {}: {}", path, e))?;
        let mut buf = [0u8; 16];
        file.read_exact(&mut buf)
            .map_err(|e| format!("Failed to read restart header from {}: {}", path, e))?;

        let time = f64::from_le_bytes(buf[0..8].try_into().map_err(|_| "short read")?);
        let ntot = u32::from_le_bytes(buf[8..12].try_into().map_err(|_| "short read")?);
        let ncomp = u32::from_le_bytes(buf[12..16].try_into().map_err(|_| "short read")?);
        Ok(Self { time, ntot, ncomp })
    }

    /// Share rank 0's header with every worker, as three f64 slots.
    pub fn exchange(header: Option<Self>, comm: &dyn Collective) -> Self {
        let mut buf = match header {
            Some(h) if comm.rank() == 0 => [h.time, h.ntot as f64, h.ncomp as f64],
            _ => [0.0; 3],
        };
        comm.broadcast(&mut buf, 0);
        Self {
            time: buf[0],
            ntot: buf[1] as u32,
            ncomp: buf[2] as u32,
        }
    }
}

/// Read per-worker processing rates, normalized to sum to 1.
///
/// A missing file is a warning, not an error: the cluster is assumed
/// homogeneous and every worker gets the same rate. A present file with a
/// malformed or missing entry is fatal.
pub fn read_rates(path: Option<&str>, size: usize) -> Result<Vec<f64>, String> {
    let path = match path {
        Some(p) => p,
        None => return Ok(vec![1.0 / size as f64; size]),
    };

    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(
                "rate file {} unavailable ({}); assuming a homogeneous cluster",
                path,
                e
            );
            return Ok(vec![1.0 / size as f64; size]);
        }
    };

    let mut rates = Vec::with_capacity(size);
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let r: f64 = line
            .parse()
            .map_err(|e| format!("{}:{}: bad rate {:?}: {}", path, lineno + 1, line, e))?;
        if r <= 0.0 {
            return Err(format!("{}:{}: rate must be positive", path, lineno + 1));
        }
        rates.push(r);
    }
    if rates.len() != size {
        return Err(format!(
            "{}: expected {} rates (one per worker), got {}",
            path,
            size,
            rates.len()
        ));
    }

    let sum: f64 = rates.iter().sum();
    for r in rates.iter_mut() {
        *r /= sum;
    }
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> SystemConfig {
        SystemConfig {
            name: "test".to_string(),
            components: vec![
                ComponentEntry {
                    name: "halo".to_string(),
                    description_file: "halo.desc".to_string(),
                },
                ComponentEntry {
                    name: "disk".to_string(),
                    description_file: "disk.desc".to_string(),
                },
            ],
            interactions: vec![InteractionEntry {
                source: "halo".to_string(),
                target: "disk".to_string(),
            }],
            rate_file: None,
            restart_file: None,
            multistep: 2,
            threads: 1,
            nbalance: 0,
            dbthresh: default_dbthresh(),
            zero_com_accel: false,
        }
    }

    #[test]
    fn validation_accepts_base_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validation_rejects_unknown_interaction_names() {
        let mut config = base_config();
        config.interactions[0].target = "bulge".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_self_interaction() {
        let mut config = base_config();
        config.interactions[0].target = "halo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_duplicate_names() {
        let mut config = base_config();
        config.components[1].name = "halo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn params_parse_and_typed_getters() {
        let p = Params::parse("lmax=4 rmax=20.0 selfcons=true tag=cb").unwrap();
        assert_eq!(p.get_usize("lmax", 0).unwrap(), 4);
        assert_eq!(p.get_f64("rmax", 1.0).unwrap(), 20.0);
        assert!(p.get_bool("selfcons", false).unwrap());
        assert_eq!(p.get_str("tag", "none"), "cb");
        assert_eq!(p.get_usize("nmax", 10).unwrap(), 10);
        assert!(p.get_usize("rmax", 0).is_err());
        assert!(Params::parse("lmax").is_err());
    }

    #[test]
    fn description_file_round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join("scf_desc_test.desc");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "# halo component").unwrap();
        writeln!(f, "sphere : lmax=4 nmax=10 : halo.bods : com=true").unwrap();
        drop(f);

        let desc = ComponentDescription::load(path.to_str().unwrap()).unwrap();
        assert_eq!(desc.id, "sphere");
        assert_eq!(desc.particle_file, "halo.bods");
        assert_eq!(desc.basis_params.get_usize("lmax", 0).unwrap(), 4);
        assert!(desc.runtime_params.get_bool("com", false).unwrap());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn description_file_rejects_wrong_field_count() {
        let dir = std::env::temp_dir();
        let path = dir.join("scf_desc_bad.desc");
        fs::write(&path, "sphere : lmax=4\n").unwrap();
        assert!(ComponentDescription::load(path.to_str().unwrap()).is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn master_header_reads_little_endian() {
        let dir = std::env::temp_dir();
        let path = dir.join("scf_header_test.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&12.5f64.to_le_bytes());
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let h = MasterHeader::read(path.to_str().unwrap()).unwrap();
        assert_eq!(h.time, 12.5);
        assert_eq!(h.ntot, 1000);
        assert_eq!(h.ncomp, 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_rate_file_assumes_homogeneous() {
        let rates = read_rates(Some("/nonexistent/rates.txt"), 4).unwrap();
        assert_eq!(rates, vec![0.25; 4]);
    }

    #[test]
    fn rate_file_is_normalized_and_strict() {
        let dir = std::env::temp_dir();
        let path = dir.join("scf_rates_test.txt");
        fs::write(&path, "1.0\n3.0\n").unwrap();
        let rates = read_rates(path.to_str(), 2).unwrap();
        assert!((rates[0] - 0.25).abs() < 1e-15);
        assert!((rates[1] - 0.75).abs() < 1e-15);

        fs::write(&path, "1.0\nfast\n").unwrap();
        assert!(read_rates(path.to_str(), 2).is_err());

        fs::write(&path, "1.0\n").unwrap();
        assert!(read_rates(path.to_str(), 2).is_err());
        let _ = fs::remove_file(&path);
    }
}
