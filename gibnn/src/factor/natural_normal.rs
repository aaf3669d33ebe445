use crate::error::configuration;
use crate::linalg::{cholesky, logdet_from_cholesky, transpose_last, tril_inverse};
use candle_core::{DType, Device, Result, Tensor, D};
use pvi_data::RandomState;

/// Gaussian over the rows of a weight matrix in natural-parameter form
///
/// Each output unit `d` owns an independent Gaussian over its incoming
/// weights `w_d` with precision `Λ_d` and precision-weighted mean
/// `η_d = Λ_d μ_d`. Leading axes (e.g., Monte Carlo samples) are
/// batch dimensions.
#[derive(Clone, Debug)]
pub struct NaturalNormal {
    /// precision-weighted mean (.. x dout x din x 1)
    eta: Tensor,
    /// precision (.. x dout x din x din)
    lam: Tensor,
}

/// Moments recovered from the natural parameters
struct Moments {
    /// Cholesky factor of the precision
    chol: Tensor,
    /// inverse of the Cholesky factor
    chol_inv: Tensor,
    /// mean (.. x dout x din x 1)
    mean: Tensor,
}

impl NaturalNormal {
    ///
    /// * `eta` - precision-weighted mean (.. x dout x din x 1)
    /// * `lam` - precision (.. x dout x din x din)
    ///
    pub fn new(eta: Tensor, lam: Tensor) -> anyhow::Result<Self> {
        let (e, l) = (eta.dims(), lam.dims());
        let ok = e.len() >= 3
            && e.len() == l.len()
            && e[e.len() - 1] == 1
            && l[l.len() - 1] == l[l.len() - 2]
            && e[..e.len() - 1] == l[..l.len() - 1];
        if !ok {
            return Err(configuration(format!(
                "natural parameters disagree: eta {:?}, lam {:?}",
                e, l
            )));
        }
        Ok(Self { eta, lam })
    }

    /// Diagonal Gaussian from per-weight means and precisions
    ///
    /// * `mean` - weight means (.. x dout x din)
    /// * `precision` - positive weight precisions (.. x dout x din)
    pub fn from_mean_precision(mean: &Tensor, precision: &Tensor) -> anyhow::Result<Self> {
        let din = precision.dim(D::Minus1)?;
        let eye = Tensor::eye(din, precision.dtype(), precision.device())?;
        let eta = mean.mul(precision)?.unsqueeze(D::Minus1)?;
        let lam = precision.unsqueeze(D::Minus1)?.broadcast_mul(&eye)?;
        Self::new(eta, lam)
    }

    /// Zero-mean isotropic Gaussian N(0, I / precision) over a
    /// `dout x din` weight matrix
    pub fn isotropic(
        dout: usize,
        din: usize,
        precision: f64,
        dtype: DType,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let eta = Tensor::zeros((dout, din, 1), dtype, device)?;
        let lam = (Tensor::eye(din, dtype, device)?
            .unsqueeze(0)?
            .broadcast_as((dout, din, din))?
            .contiguous()?
            * precision)?;
        Self::new(eta, lam)
    }

    pub fn eta(&self) -> &Tensor {
        &self.eta
    }

    pub fn lam(&self) -> &Tensor {
        &self.lam
    }

    /// number of output units
    pub fn dout(&self) -> Result<usize> {
        self.eta.dim(self.eta.rank() - 3)
    }

    /// number of input units
    pub fn din(&self) -> Result<usize> {
        self.eta.dim(self.eta.rank() - 2)
    }

    /// Product of the two densities: natural parameters add up
    /// (with broadcasting over the batch axes)
    pub fn combine(&self, other: &Self) -> Result<Self> {
        Ok(Self {
            eta: self.eta.broadcast_add(&other.eta)?,
            lam: self.lam.broadcast_add(&other.lam)?,
        })
    }

    /// Deep copy with gradient history severed
    pub fn detached(&self) -> Result<Self> {
        Ok(Self {
            eta: self.eta.copy()?.detach(),
            lam: self.lam.copy()?.detach(),
        })
    }

    ///
    /// Make sure the leading axis holds `num_samples` draws; a factor
    /// without a sample axis is tiled
    ///
    pub fn with_samples(&self, num_samples: usize) -> anyhow::Result<Self> {
        let rank = self.eta.rank();
        if rank == 3 {
            let tile = |t: &Tensor| -> Result<Tensor> {
                let mut shape = vec![num_samples];
                shape.extend_from_slice(t.dims());
                t.unsqueeze(0)?.broadcast_as(shape)?.contiguous()
            };
            return Ok(Self {
                eta: tile(&self.eta)?,
                lam: tile(&self.lam)?,
            });
        }
        match self.eta.dim(0)? {
            s if s == num_samples && rank == 4 => Ok(self.clone()),
            1 if rank == 4 => {
                let tile = |t: &Tensor| -> Result<Tensor> {
                    let mut shape = t.dims().to_vec();
                    shape[0] = num_samples;
                    t.broadcast_as(shape)?.contiguous()
                };
                Ok(Self {
                    eta: tile(&self.eta)?,
                    lam: tile(&self.lam)?,
                })
            }
            s => Err(configuration(format!(
                "factor carries {} samples (rank {}), asked for {}",
                s, rank, num_samples
            ))),
        }
    }

    fn moments(&self) -> anyhow::Result<Moments> {
        let chol = cholesky(&self.lam)?;
        let chol_inv = tril_inverse(&chol)?;
        let mean = transpose_last(&chol_inv)?.matmul(&chol_inv.matmul(&self.eta)?)?;
        Ok(Moments {
            chol,
            chol_inv,
            mean,
        })
    }

    /// Mean `Λ⁻¹ η` (.. x dout x din x 1)
    pub fn mean(&self) -> anyhow::Result<Tensor> {
        Ok(self.moments()?.mean)
    }

    /// Covariance `Λ⁻¹` (.. x dout x din x din)
    pub fn covariance(&self) -> anyhow::Result<Tensor> {
        let chol_inv = self.moments()?.chol_inv;
        Ok(transpose_last(&chol_inv)?.matmul(&chol_inv)?)
    }

    ///
    /// Reparameterized draw `w = μ + L⁻ᵀ ε` with `Λ = L Lᵀ`, one per
    /// batch element
    ///
    /// # Returns `(key, w)` where `w` has the shape of `eta`
    ///
    pub fn sample(&self, key: RandomState) -> anyhow::Result<(RandomState, Tensor)> {
        let m = self.moments()?;
        let (key, eps) = key.randn(self.eta.shape(), self.eta.dtype(), self.eta.device())?;
        let w = (m.mean + transpose_last(&m.chol_inv)?.matmul(&eps)?)?;
        Ok((key, w))
    }

    ///
    /// KL(self || reference), summed over output units
    ///
    /// Both must describe the same weights; the reference may omit the
    /// leading batch axes.
    ///
    /// ```text
    /// KL = 0.5 * [ tr(Λp Σq) + (μq - μp)ᵀ Λp (μq - μp) - din + log|Λq| - log|Λp| ]
    /// ```
    ///
    /// # Returns KL with the batch shape (e.g., `S`)
    pub fn kl_to(&self, reference: &Self) -> anyhow::Result<Tensor> {
        let q = self.moments()?;
        let p = reference.moments()?;
        let din = self.din()? as f64;

        let lam_p = reference.lam.broadcast_as(self.lam.shape())?.contiguous()?;

        let trace = q
            .chol_inv
            .matmul(&lam_p)?
            .mul(&q.chol_inv)?
            .sum(D::Minus1)?
            .sum(D::Minus1)?;

        let diff = q.mean.broadcast_sub(&p.mean)?.contiguous()?;
        let maha = transpose_last(&diff)?
            .matmul(&lam_p.matmul(&diff)?)?
            .squeeze(D::Minus1)?
            .squeeze(D::Minus1)?;

        let logdet_q = logdet_from_cholesky(&q.chol)?;
        let logdet_p = logdet_from_cholesky(&p.chol)?;

        let kl = ((((trace + maha)? - din)? + logdet_q)?.broadcast_sub(&logdet_p)? * 0.5)?;
        Ok(kl.sum(D::Minus1)?)
    }
}
