//! Pre-tabulated basis-function tables.
//!
//! The solver treats basis construction as opaque numerics: tables are built
//! once (from an analytic family, from the current particle distribution, or
//! from an on-disk cache) and afterwards only sampled by interpolation.
//! Values and derivatives are tabulated on regular grids; sampling is linear
//! (radial tables) or bilinear (cylindrical tables).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use crate::particle::ParticleSet;

/// Magic tag at the head of a cylindrical table cache file.
const CYL_CACHE_MAGIC: u64 = 0x5343_4643_594c_0001; // "SCFCYL" v1

// ---------------------------------------------------------------------------
// Radial tables (spherical basis)
// ---------------------------------------------------------------------------

/// Radial basis functions for the spherical expansion, tabulated per
/// `(l, n)` on a regular radius grid with their radial derivatives.
///
/// The family is the Clutton-Brock ultraspherical set: with `xi = (r^2 - 1)
/// / (r^2 + 1)` (radius in units of the scale length),
/// `phi_{ln}(r) = -r^l / (1 + r^2)^{l + 1/2} * C^{(l+1)}_{n-1}(xi)`.
#[derive(Debug, Clone)]
pub struct RadialTable {
    lmax: usize,
    nmax: usize,
    rmax: f64,
    scale: f64,
    nr: usize,
    dr: f64,
    // [l][n][ir] flattened
    val: Vec<f64>,
    dval: Vec<f64>,
}

/// Gegenbauer polynomials C^(alpha)_k(x) for k in 0..count.
fn gegenbauer(alpha: f64, x: f64, count: usize, out: &mut Vec<f64>) {
    out.clear();
    if count == 0 {
        return;
    }
    out.push(1.0);
    if count == 1 {
        return;
    }
    out.push(2.0 * alpha * x);
    for k in 2..count {
        let kf = k as f64;
        let next = (2.0 * (kf + alpha - 1.0) * x * out[k - 1]
            - (kf + 2.0 * alpha - 2.0) * out[k - 2])
            / kf;
        out.push(next);
    }
}

impl RadialTable {
    /// Build the table for harmonics `0..=lmax`, radial orders `1..=nmax`,
    /// on `nr` grid points spanning `[0, rmax]` (rmax in length units;
    /// `scale` is the family's scale length).
    pub fn build(lmax: usize, nmax: usize, rmax: f64, scale: f64, nr: usize) -> Self {
        assert!(nr >= 4, "radial grid needs at least 4 points");
        assert!(rmax > 0.0 && scale > 0.0);

        let dr = rmax / (nr - 1) as f64;
        let mut val = vec![0.0; (lmax + 1) * nmax * nr];
        let mut geg = Vec::with_capacity(nmax);

        for ir in 0..nr {
            let r = dr * ir as f64 / scale;
            let r2 = r * r;
            let xi = (r2 - 1.0) / (r2 + 1.0);
            for l in 0..=lmax {
                let alpha = (l + 1) as f64;
                gegenbauer(alpha, xi, nmax, &mut geg);
                let envelope = -r.powi(l as i32) / (1.0 + r2).powf(l as f64 + 0.5);
                for n in 0..nmax {
                    val[(l * nmax + n) * nr + ir] = envelope * geg[n];
                }
            }
        }

        // Radial derivatives by central differences on the grid; one-sided
        // at the ends.
        let mut dval = vec![0.0; val.len()];
        for l in 0..=lmax {
            for n in 0..nmax {
                let base = (l * nmax + n) * nr;
                for ir in 0..nr {
                    let d = if ir == 0 {
                        (val[base + 1] - val[base]) / dr
                    } else if ir == nr - 1 {
                        (val[base + ir] - val[base + ir - 1]) / dr
                    } else {
                        (val[base + ir + 1] - val[base + ir - 1]) / (2.0 * dr)
                    };
                    dval[base + ir] = d;
                }
            }
        }

        Self {
            lmax,
            nmax,
            rmax,
            scale,
            nr,
            dr,
            val,
            dval,
        }
    }

    /// Highest harmonic order.
    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// Number of radial orders.
    pub fn nmax(&self) -> usize {
        self.nmax
    }

    /// Outer edge of the tabulated grid.
    pub fn rmax(&self) -> f64 {
        self.rmax
    }

    /// Scale length of the tabulated family.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    #[inline]
    fn sample(&self, data: &[f64], l: usize, n: usize, r: f64) -> f64 {
        let base = (l * self.nmax + n) * self.nr;
        let r = r.clamp(0.0, self.rmax);
        let g = r / self.dr;
        let i0 = (g.floor() as usize).min(self.nr - 2);
        let f = g - i0 as f64;
        data[base + i0] * (1.0 - f) + data[base + i0 + 1] * f
    }

    /// Basis value `phi_{ln}(r)`; radii beyond the grid clamp to the edge.
    #[inline]
    pub fn value(&self, l: usize, n: usize, r: f64) -> f64 {
        self.sample(&self.val, l, n, r)
    }

    /// Radial derivative `d phi_{ln} / dr`.
    #[inline]
    pub fn deriv(&self, l: usize, n: usize, r: f64) -> f64 {
        self.sample(&self.dval, l, n, r)
    }
}

// ---------------------------------------------------------------------------
// Cylindrical tables (disk basis)
// ---------------------------------------------------------------------------

/// Shape parameters of a cylindrical table.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CylParams {
    /// Highest azimuthal order.
    pub mmax: usize,
    /// Number of radial orders.
    pub norder: usize,
    /// Radial scale length.
    pub ascale: f64,
    /// Vertical scale height.
    pub hscale: f64,
    /// Grid extent in R, in units of `ascale`.
    pub rfac: f64,
    /// Grid extent in |z|, in units of `hscale`.
    pub zfac: f64,
    /// Grid points in R.
    pub nx: usize,
    /// Grid points in z.
    pub nz: usize,
}

impl CylParams {
    /// Outer radius of the tabulated grid.
    pub fn rmax(&self) -> f64 {
        self.rfac * self.ascale
    }

    /// Half-height of the tabulated grid.
    pub fn zmax(&self) -> f64 {
        self.zfac * self.hscale
    }
}

/// Empirical disk basis tables: per `(m, n)`, grids over `(R, z)` of the
/// potential function and its two force components `(-dPhi/dR, -dPhi/dz)`.
#[derive(Debug, Clone)]
pub struct CylTable {
    params: CylParams,
    dx: f64,
    dz: f64,
    // [m][n][ix][iz] flattened
    pot: Vec<f64>,
    fr: Vec<f64>,
    fz: Vec<f64>,
}

/// Laguerre polynomials L_k(x) for k in 0..count.
fn laguerre(x: f64, count: usize, out: &mut Vec<f64>) {
    out.clear();
    if count == 0 {
        return;
    }
    out.push(1.0);
    if count == 1 {
        return;
    }
    out.push(1.0 - x);
    for k in 2..count {
        let kf = (k - 1) as f64;
        let next = ((2.0 * kf + 1.0 - x) * out[k - 1] - kf * out[k - 2]) / (kf + 1.0);
        out.push(next);
    }
}

impl CylTable {
    /// Build tables from the analytic seed family: radial Laguerre
    /// oscillations under an exponential envelope, `(R/(R+a))^m` azimuthal
    /// regularization, and a sech vertical profile.
    pub fn analytic(params: CylParams) -> Self {
        assert!(params.nx >= 4 && params.nz >= 4, "cylindrical grid too coarse");
        assert!(params.ascale > 0.0 && params.hscale > 0.0);

        let rmax = params.rmax();
        let zmax = params.zmax();
        let dx = rmax / (params.nx - 1) as f64;
        let dz = 2.0 * zmax / (params.nz - 1) as f64;

        let count = params.norder;
        let mut lag = Vec::with_capacity(count);
        let size = (params.mmax + 1) * count * params.nx * params.nz;
        let mut pot = vec![0.0; size];

        for ix in 0..params.nx {
            let big_r = dx * ix as f64;
            let xarg = big_r / params.ascale;
            laguerre(xarg, count, &mut lag);
            let radial_env = (-0.5 * xarg).exp();
            for iz in 0..params.nz {
                let zed = -zmax + dz * iz as f64;
                let vert = 1.0 / (zed / params.hscale).cosh();
                for m in 0..=params.mmax {
                    let reg = (big_r / (big_r + params.ascale)).powi(m as i32);
                    for n in 0..count {
                        let idx = ((m * count + n) * params.nx + ix) * params.nz + iz;
                        pot[idx] = -reg * radial_env * lag[n] * vert;
                    }
                }
            }
        }

        // Force grids from central differences of the potential grid.
        let mut fr = vec![0.0; size];
        let mut fz = vec![0.0; size];
        let at = |p: &[f64], m: usize, n: usize, ix: usize, iz: usize| {
            p[((m * count + n) * params.nx + ix) * params.nz + iz]
        };
        for m in 0..=params.mmax {
            for n in 0..count {
                for ix in 0..params.nx {
                    for iz in 0..params.nz {
                        let idx = ((m * count + n) * params.nx + ix) * params.nz + iz;
                        let dpdr = if ix == 0 {
                            (at(&pot, m, n, 1, iz) - at(&pot, m, n, 0, iz)) / dx
                        } else if ix == params.nx - 1 {
                            (at(&pot, m, n, ix, iz) - at(&pot, m, n, ix - 1, iz)) / dx
                        } else {
                            (at(&pot, m, n, ix + 1, iz) - at(&pot, m, n, ix - 1, iz))
                                / (2.0 * dx)
                        };
                        let dpdz = if iz == 0 {
                            (at(&pot, m, n, ix, 1) - at(&pot, m, n, ix, 0)) / dz
                        } else if iz == params.nz - 1 {
                            (at(&pot, m, n, ix, iz) - at(&pot, m, n, ix, iz - 1)) / dz
                        } else {
                            (at(&pot, m, n, ix, iz + 1) - at(&pot, m, n, ix, iz - 1))
                                / (2.0 * dz)
                        };
                        fr[idx] = -dpdr;
                        fz[idx] = -dpdz;
                    }
                }
            }
        }

        Self {
            params,
            dx,
            dz,
            pot,
            fr,
            fz,
        }
    }

    /// Rebuild the tables conditioned on the current particle distribution:
    /// the radial scale is re-fit to the mass-weighted mean cylindrical
    /// radius and the vertical scale to the mass-weighted mean |z| about
    /// `center`, then the family is re-tabulated.
    pub fn rebuild_from(params: CylParams, set: &ParticleSet, center: [f64; 3]) -> Self {
        let mut mtot = 0.0;
        let mut rbar = 0.0;
        let mut zbar = 0.0;
        for i in 0..set.len() {
            if set.frozen[i] {
                continue;
            }
            let m = set.mass[i];
            let dx = set.x[i] - center[0];
            let dy = set.y[i] - center[1];
            let dzc = set.z[i] - center[2];
            mtot += m;
            rbar += m * (dx * dx + dy * dy).sqrt();
            zbar += m * dzc.abs();
        }

        let mut fitted = params;
        if mtot > 0.0 {
            // Exponential disk: <R> = 2a, isothermal-ish slab: <|z|> ~ h.
            fitted.ascale = (0.5 * rbar / mtot).max(1e-8);
            fitted.hscale = (zbar / mtot).max(1e-8);
        }
        tracing::debug!(
            "empirical table rebuild: ascale={:.6} hscale={:.6} (mass {:.6})",
            fitted.ascale,
            fitted.hscale,
            mtot
        );
        Self::analytic(fitted)
    }

    /// Table shape parameters.
    pub fn params(&self) -> &CylParams {
        &self.params
    }

    #[inline]
    fn bilinear(&self, data: &[f64], m: usize, n: usize, big_r: f64, zed: f64) -> f64 {
        let p = &self.params;
        let gx = (big_r.clamp(0.0, p.rmax())) / self.dx;
        let gz = (zed.clamp(-p.zmax(), p.zmax()) + p.zmax()) / self.dz;
        let ix = (gx.floor() as usize).min(p.nx - 2);
        let iz = (gz.floor() as usize).min(p.nz - 2);
        let fx = gx - ix as f64;
        let fz = gz - iz as f64;
        let base = (m * p.norder + n) * p.nx;
        let at = |x: usize, z: usize| data[(base + x) * p.nz + z];
        let c0 = at(ix, iz) * (1.0 - fz) + at(ix, iz + 1) * fz;
        let c1 = at(ix + 1, iz) * (1.0 - fz) + at(ix + 1, iz + 1) * fz;
        c0 * (1.0 - fx) + c1 * fx
    }

    /// Potential basis value at `(R, z)` for `(m, n)`.
    #[inline]
    pub fn value(&self, m: usize, n: usize, big_r: f64, zed: f64) -> f64 {
        self.bilinear(&self.pot, m, n, big_r, zed)
    }

    /// Force basis components `(f_R, f_z)` at `(R, z)` for `(m, n)`.
    #[inline]
    pub fn force(&self, m: usize, n: usize, big_r: f64, zed: f64) -> (f64, f64) {
        (
            self.bilinear(&self.fr, m, n, big_r, zed),
            self.bilinear(&self.fz, m, n, big_r, zed),
        )
    }

    /// Write a binary cache snapshot: magic, shape, parameters, and the
    /// three table payloads, little-endian throughout.
    pub fn write_cache(&self, path: &str) -> Result<(), String> {
        let file = File::create(path)
            .map_err(|e| format!("Failed to create basis cache {}: {}", path, e))?;
        let mut w = BufWriter::new(file);
        let p = &self.params;

        let err = |e: std::io::Error| format!("Failed to write basis cache {}: {}", path, e);
        w.write_all(&CYL_CACHE_MAGIC.to_le_bytes()).map_err(err)?;
        for v in [p.mmax as u64, p.norder as u64, p.nx as u64, p.nz as u64] {
            w.write_all(&v.to_le_bytes()).map_err(err)?;
        }
        for v in [p.ascale, p.hscale, p.rfac, p.zfac] {
            w.write_all(&v.to_le_bytes()).map_err(err)?;
        }
        for table in [&self.pot, &self.fr, &self.fz] {
            for v in table.iter() {
                w.write_all(&v.to_le_bytes()).map_err(err)?;
            }
        }
        w.flush().map_err(err)?;
        Ok(())
    }

    /// Read a cache snapshot written by [`CylTable::write_cache`]. A
    /// missing, truncated, or mismatched file is an error; callers fall back
    /// to rebuilding from particles.
    pub fn read_cache(path: &str) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|e| format!("Failed to open basis cache {}: {}", path, e))?;
        let mut r = BufReader::new(file);

        let err = |e: std::io::Error| format!("Failed to read basis cache {}: {}", path, e);
        let mut u64buf = [0u8; 8];

        r.read_exact(&mut u64buf).map_err(err)?;
        if u64::from_le_bytes(u64buf) != CYL_CACHE_MAGIC {
            return Err(format!("Basis cache {} has wrong magic", path));
        }

        let mut dims = [0usize; 4];
        for d in dims.iter_mut() {
            r.read_exact(&mut u64buf).map_err(err)?;
            *d = u64::from_le_bytes(u64buf) as usize;
        }
        let mut reals = [0f64; 4];
        for v in reals.iter_mut() {
            r.read_exact(&mut u64buf).map_err(err)?;
            *v = f64::from_le_bytes(u64buf);
        }

        let params = CylParams {
            mmax: dims[0],
            norder: dims[1],
            nx: dims[2],
            nz: dims[3],
            ascale: reals[0],
            hscale: reals[1],
            rfac: reals[2],
            zfac: reals[3],
        };
        if params.nx < 4 || params.nz < 4 || params.ascale <= 0.0 || params.hscale <= 0.0 {
            return Err(format!("Basis cache {} has implausible parameters", path));
        }

        let size = (params.mmax + 1) * params.norder * params.nx * params.nz;
        let mut read_table = |r: &mut BufReader<File>| -> Result<Vec<f64>, String> {
            let mut t = vec![0.0; size];
            for v in t.iter_mut() {
                let mut b = [0u8; 8];
                r.read_exact(&mut b).map_err(err)?;
                *v = f64::from_le_bytes(b);
            }
            Ok(t)
        };
        let pot = read_table(&mut r)?;
        let fr = read_table(&mut r)?;
        let fz = read_table(&mut r)?;

        Ok(Self {
            dx: params.rmax() / (params.nx - 1) as f64,
            dz: 2.0 * params.zmax() / (params.nz - 1) as f64,
            params,
            pot,
            fr,
            fz,
        })
    }
}
