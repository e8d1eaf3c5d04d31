//! Struct-of-arrays particle storage and per-level index lists.

use std::fs;

/// Struct-of-arrays particle storage.
///
/// All arrays are parallel: index `i` across every array refers to the same
/// particle. Separate x/y/z arrays (rather than a vector type) are used
/// deliberately so accumulation loops stream through contiguous memory.
#[derive(Debug, Clone)]
pub struct ParticleSet {
    /// Particle masses.
    pub mass: Vec<f64>,
    /// X positions.
    pub x: Vec<f64>,
    /// Y positions.
    pub y: Vec<f64>,
    /// Z positions.
    pub z: Vec<f64>,
    /// X velocities.
    pub vx: Vec<f64>,
    /// Y velocities.
    pub vy: Vec<f64>,
    /// Z velocities.
    pub vz: Vec<f64>,
    /// X accelerations (accumulated each force pass).
    pub ax: Vec<f64>,
    /// Y accelerations.
    pub ay: Vec<f64>,
    /// Z accelerations.
    pub az: Vec<f64>,
    /// Self potential (from the owning component's own field).
    pub pot: Vec<f64>,
    /// External potential (from interaction edges and external forces).
    pub potext: Vec<f64>,
    /// Multistep refinement level.
    pub level: Vec<usize>,
    /// Frozen particles contribute to no field and receive no corrections.
    pub frozen: Vec<bool>,
    /// Auxiliary scalar attribute columns, carried for external collaborators
    /// and not interpreted by this crate. Each column is parallel to `mass`.
    pub attrs: Vec<Vec<f64>>,
}

impl ParticleSet {
    /// Create an empty particle set.
    pub fn new() -> Self {
        Self {
            mass: Vec::new(),
            x: Vec::new(),
            y: Vec::new(),
            z: Vec::new(),
            vx: Vec::new(),
            vy: Vec::new(),
            vz: Vec::new(),
            ax: Vec::new(),
            ay: Vec::new(),
            az: Vec::new(),
            pot: Vec::new(),
            potext: Vec::new(),
            level: Vec::new(),
            frozen: Vec::new(),
            attrs: Vec::new(),
        }
    }

    /// Number of particles currently stored.
    pub fn len(&self) -> usize {
        self.mass.len()
    }

    /// Return `true` if there are no particles.
    pub fn is_empty(&self) -> bool {
        self.mass.is_empty()
    }

    /// Append a single particle with the given mass, position, and velocity.
    ///
    /// Acceleration and both potentials start at zero; the particle begins
    /// at level 0, unfrozen. Existing attribute columns are padded with 0.
    pub fn push_particle(&mut self, mass: f64, pos: [f64; 3], vel: [f64; 3]) {
        self.mass.push(mass);
        self.x.push(pos[0]);
        self.y.push(pos[1]);
        self.z.push(pos[2]);
        self.vx.push(vel[0]);
        self.vy.push(vel[1]);
        self.vz.push(vel[2]);
        self.ax.push(0.0);
        self.ay.push(0.0);
        self.az.push(0.0);
        self.pot.push(0.0);
        self.potext.push(0.0);
        self.level.push(0);
        self.frozen.push(false);
        for col in &mut self.attrs {
            col.push(0.0);
        }
    }

    /// Position of particle `i`.
    pub fn position(&self, i: usize) -> [f64; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }

    /// Total mass of unfrozen particles.
    pub fn active_mass(&self) -> f64 {
        let mut m = 0.0;
        for i in 0..self.len() {
            if !self.frozen[i] {
                m += self.mass[i];
            }
        }
        m
    }

    /// Read a particle set from a plain-text file: one particle per line,
    /// whitespace-separated `mass x y z vx vy vz`. Blank lines and lines
    /// starting with `#` are skipped.
    pub fn read_text(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read particle file {}: {}", path, e))?;

        let mut set = Self::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<f64> = line
                .split_whitespace()
                .map(|t| {
                    t.parse::<f64>().map_err(|e| {
                        format!("{}:{}: bad field {:?}: {}", path, lineno + 1, t, e)
                    })
                })
                .collect::<Result<_, _>>()?;
            if fields.len() < 7 {
                return Err(format!(
                    "{}:{}: expected 7 fields (mass x y z vx vy vz), got {}",
                    path,
                    lineno + 1,
                    fields.len()
                ));
            }
            set.push_particle(
                fields[0],
                [fields[1], fields[2], fields[3]],
                [fields[4], fields[5], fields[6]],
            );
        }
        Ok(set)
    }
}

impl Default for ParticleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-level ordered lists of particle indices.
///
/// Every particle index belongs to exactly one list at a time; visiting the
/// lists for levels `m..=max` touches each active particle exactly once.
#[derive(Debug, Clone)]
pub struct LevelLists {
    lists: Vec<Vec<usize>>,
}

impl LevelLists {
    /// Build level lists for `set` with levels `0..=max_level`, placing each
    /// particle according to its current `level` field.
    pub fn build(set: &ParticleSet, max_level: usize) -> Self {
        let mut lists = vec![Vec::new(); max_level + 1];
        for i in 0..set.len() {
            let lev = set.level[i].min(max_level);
            lists[lev].push(i);
        }
        Self { lists }
    }

    /// Highest level index.
    pub fn max_level(&self) -> usize {
        self.lists.len() - 1
    }

    /// Particle indices currently at `level`.
    pub fn at(&self, level: usize) -> &[usize] {
        &self.lists[level]
    }

    /// Total number of indices across all levels.
    pub fn total(&self) -> usize {
        self.lists.iter().map(|l| l.len()).sum()
    }

    /// Move particle `idx` to level `to`, updating the set's level field.
    /// Returns the level it was moved from.
    pub fn assign(&mut self, set: &mut ParticleSet, idx: usize, to: usize) -> usize {
        let from = set.level[idx];
        if from == to {
            return from;
        }
        if let Some(pos) = self.lists[from].iter().position(|&i| i == idx) {
            self.lists[from].remove(pos);
        }
        self.lists[to].push(idx);
        set.level[idx] = to;
        from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_particle_set() {
        let set = ParticleSet::new();
        assert_eq!(set.len(), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn push_and_fields() {
        let mut set = ParticleSet::new();
        set.push_particle(2.0, [1.0, 2.0, 3.0], [0.1, 0.2, 0.3]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.mass[0], 2.0);
        assert_eq!(set.position(0), [1.0, 2.0, 3.0]);
        assert_eq!(set.vz[0], 0.3);
        assert_eq!(set.ax[0], 0.0);
        assert_eq!(set.pot[0], 0.0);
        assert_eq!(set.potext[0], 0.0);
        assert_eq!(set.level[0], 0);
        assert!(!set.frozen[0]);
    }

    #[test]
    fn active_mass_skips_frozen() {
        let mut set = ParticleSet::new();
        set.push_particle(1.0, [0.0; 3], [0.0; 3]);
        set.push_particle(3.0, [1.0, 0.0, 0.0], [0.0; 3]);
        set.frozen[1] = true;
        assert_eq!(set.active_mass(), 1.0);
    }

    #[test]
    fn level_lists_partition_particles() {
        let mut set = ParticleSet::new();
        for i in 0..6 {
            set.push_particle(1.0, [i as f64, 0.0, 0.0], [0.0; 3]);
        }
        set.level[2] = 1;
        set.level[5] = 2;

        let lists = LevelLists::build(&set, 2);
        assert_eq!(lists.at(0).len(), 4);
        assert_eq!(lists.at(1), &[2]);
        assert_eq!(lists.at(2), &[5]);
        assert_eq!(lists.total(), 6);
    }

    #[test]
    fn assign_moves_between_lists() {
        let mut set = ParticleSet::new();
        for _ in 0..3 {
            set.push_particle(1.0, [0.0; 3], [0.0; 3]);
        }
        let mut lists = LevelLists::build(&set, 2);

        let from = lists.assign(&mut set, 1, 2);
        assert_eq!(from, 0);
        assert_eq!(set.level[1], 2);
        assert_eq!(lists.at(0), &[0, 2]);
        assert_eq!(lists.at(2), &[1]);
        assert_eq!(lists.total(), 3);

        // Assigning to the same level is a no-op.
        let from = lists.assign(&mut set, 1, 2);
        assert_eq!(from, 2);
        assert_eq!(lists.total(), 3);
    }
}
