//! PCA-based coefficient denoising (Hall-style shrinkage).
//!
//! Accumulation can be split into `samp_t` jackknife partitions; the spread
//! across partitions estimates the sampling noise of each coefficient. Per
//! harmonic row, the coefficient amplitudes are rotated into the principal
//! basis of their cross-partition covariance, shrunk order-by-order, and
//! rotated back.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::coeff::CoeffTable;

/// Shrinkage rule applied in the principal basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shrinkage {
    /// Hall factor `1 / (1 + var / t^2)` per order.
    Hall,
    /// Hard 0/1 cut: drop orders where `smooth * var > t^2`.
    VarianceCut,
    /// Keep leading orders while the cumulative eigenvalue fraction stays
    /// at or below `cum`.
    CumulativeCut,
    /// Soft weighting `1 / (1 + var / (t^2 + eps))`.
    VarianceWeighted,
    /// Compute diagnostics only; coefficients pass through untouched.
    Null,
}

/// Denoiser configuration.
#[derive(Debug, Clone, Copy)]
pub struct PcaConfig {
    /// Number of jackknife partitions (particle index modulo `samp_t`).
    pub samp_t: usize,
    /// Which shrinkage rule to apply.
    pub kind: Shrinkage,
    /// Variance inflation factor for [`Shrinkage::VarianceCut`].
    pub smooth: f64,
    /// Cumulative eigenvalue fraction for [`Shrinkage::CumulativeCut`].
    pub cum: f64,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            samp_t: 0,
            kind: Shrinkage::Hall,
            smooth: 1.0,
            cum: 1.0,
        }
    }
}

impl PcaConfig {
    /// True when partition accumulation should run at all.
    pub fn enabled(&self) -> bool {
        self.samp_t > 0
    }
}

/// Shrink `total` in place given the per-partition tables and their
/// accumulated masses.
///
/// With fewer than 3 partitions the covariance estimate is unreliable and
/// the table is left untouched, as it is when no mass was accumulated.
pub fn shrink(total: &mut CoeffTable, parts: &[CoeffTable], part_mass: &[f64], cfg: &PcaConfig) {
    let samp_t = parts.len();
    if samp_t < 3 {
        return;
    }
    let mtot: f64 = part_mass.iter().sum();
    if mtot <= 0.0 {
        return;
    }

    let rows = total.rows();
    let nmax = total.nmax();

    for row in 0..rows {
        // Per-partition amplitude vectors, rescaled so each partition
        // stands in for the full sample.
        let mut amp = vec![vec![0.0; nmax]; samp_t];
        for (s, part) in parts.iter().enumerate() {
            let boost = if part_mass[s] > 0.0 {
                mtot / part_mass[s]
            } else {
                0.0
            };
            for n in 0..nmax {
                let k = part.idx(row, n);
                amp[s][n] = boost * (part.cos[k].powi(2) + part.sin[k].powi(2)).sqrt();
            }
        }

        let mean = DVector::from_fn(nmax, |n, _| {
            amp.iter().map(|a| a[n]).sum::<f64>() / samp_t as f64
        });
        let cov = DMatrix::from_fn(nmax, nmax, |i, j| {
            amp.iter()
                .map(|a| (a[i] - mean[i]) * (a[j] - mean[j]))
                .sum::<f64>()
                / (samp_t - 1) as f64
        });

        let eig = SymmetricEigen::new(cov);
        let evecs = &eig.eigenvectors;
        let evals = &eig.eigenvalues;

        // Rotated mean and bootstrap variance per principal order.
        let t = evecs.transpose() * &mean;
        let var = DVector::from_fn(nmax, |n, _| evals[n].max(0.0) / samp_t as f64);

        let weights = match cfg.kind {
            Shrinkage::Hall => DVector::from_fn(nmax, |n, _| {
                let b = (var[n] / (t[n] * t[n])).max(f64::MIN_POSITIVE);
                1.0 / (1.0 + b)
            }),
            Shrinkage::VarianceCut => DVector::from_fn(nmax, |n, _| {
                if cfg.smooth * var[n] > t[n] * t[n] {
                    0.0
                } else {
                    1.0
                }
            }),
            Shrinkage::CumulativeCut => cumulative_cut_weights(evals, cfg.cum),
            Shrinkage::VarianceWeighted => DVector::from_fn(nmax, |n, _| {
                1.0 / (1.0 + var[n] / (t[n] * t[n] + 1e-14))
            }),
            Shrinkage::Null => continue,
        };

        // Rotate, weight, rotate back; cosine and sine halves share the
        // same rotation and weights.
        for half in 0..2 {
            let vec = DVector::from_fn(nmax, |n, _| {
                let k = total.idx(row, n);
                if half == 0 {
                    total.cos[k]
                } else {
                    total.sin[k]
                }
            });
            let mut rot = evecs.transpose() * vec;
            for n in 0..nmax {
                rot[n] *= weights[n];
            }
            let back = evecs * rot;
            for n in 0..nmax {
                let k = total.idx(row, n);
                if half == 0 {
                    total.cos[k] = back[n];
                } else {
                    total.sin[k] = back[n];
                }
            }
        }
    }

    tracing::debug!(
        "coefficient shrinkage applied: {:?}, {} partitions, mass {:.6}",
        cfg.kind,
        samp_t,
        mtot
    );
}

/// 0/1 weights keeping the leading eigenvalues (largest first) while their
/// cumulative fraction of the trace stays at or below `cum`.
fn cumulative_cut_weights(evals: &DVector<f64>, cum: f64) -> DVector<f64> {
    let nmax = evals.len();
    let mut order: Vec<usize> = (0..nmax).collect();
    order.sort_by(|&a, &b| {
        evals[b]
            .partial_cmp(&evals[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let trace: f64 = evals.iter().map(|v| v.max(0.0)).sum();

    let mut weights = DVector::zeros(nmax);
    if trace <= 0.0 {
        return weights;
    }
    let mut running = 0.0;
    for &n in &order {
        running += evals[n].max(0.0) / trace;
        if running > cum {
            break;
        }
        weights[n] = 1.0;
    }
    weights
}
