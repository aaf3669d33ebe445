use crate::factor::{Detach, LayerFactor, NaturalNormal};
use crate::error::configuration;
use candle_core::{Result, Tensor, D};

///
/// Gaussian pseudo-observations attached to a client's inducing inputs
///
/// For output unit `d` the layer's input at the `m`-th inducing point
/// `z_m` is paired with a pseudo target `yz[d, m]` of precision
/// `nz[d, m]`, giving the likelihood-shaped factor
///
/// ```text
/// t_d(w_d) ∝ Π_m N(yz[d, m] | w_dᵀ z_m, 1 / nz[d, m])
/// ```
///
#[derive(Clone, Debug)]
pub struct PseudoObservation {
    /// pseudo targets (dout x m)
    yz: Tensor,
    /// unconstrained pseudo precisions, `nz = exp(ln_nz)` (dout x m)
    ln_nz: Tensor,
}

impl PseudoObservation {
    ///
    /// * `yz` - pseudo targets (dout x m)
    /// * `ln_nz` - log pseudo precisions (dout x m)
    ///
    pub fn new(yz: Tensor, ln_nz: Tensor) -> anyhow::Result<Self> {
        if yz.dims().len() != 2 || yz.dims() != ln_nz.dims() {
            return Err(configuration(format!(
                "pseudo observations disagree: yz {:?}, ln_nz {:?}",
                yz.dims(),
                ln_nz.dims()
            )));
        }
        Ok(Self { yz, ln_nz })
    }

    pub fn yz(&self) -> &Tensor {
        &self.yz
    }

    /// positive pseudo precisions (dout x m)
    pub fn nz(&self) -> Result<Tensor> {
        self.ln_nz.exp()
    }

    pub fn num_inducing(&self) -> Result<usize> {
        self.yz.dim(1)
    }
}

impl Detach for PseudoObservation {
    fn detached(&self) -> Result<Self> {
        Ok(Self {
            yz: self.yz.copy()?.detach(),
            ln_nz: self.ln_nz.copy()?.detach(),
        })
    }
}

impl LayerFactor for PseudoObservation {
    ///
    /// * `inducing` - inducing inputs at this layer (S x M x din)
    ///
    /// ```text
    /// Λ[s, d] = Σ_m nz[d, m] z[s, m] z[s, m]ᵀ
    /// η[s, d] = Σ_m nz[d, m] yz[d, m] z[s, m]
    /// ```
    ///
    /// # Returns factor with shape S x dout x din x {din, 1}
    fn natural_params(&self, inducing: Option<&Tensor>) -> anyhow::Result<NaturalNormal> {
        let z = inducing.ok_or_else(|| {
            configuration("pseudo-observation factors need the inducing inputs of their layer")
        })?;
        let (dout, m) = self.yz.dims2()?;
        let m_z = z.dim(D::Minus2)?;
        if m_z != m {
            return Err(configuration(format!(
                "{} inducing inputs for {} pseudo observations",
                m_z, m
            )));
        }

        let nz = self.nz()?;
        let zt = z.unsqueeze(1)?; // S x 1 x M x din
        let z_tr = zt.transpose(2, 3)?.contiguous()?; // S x 1 x din x M

        let weighted = zt.broadcast_mul(&nz.reshape((1, dout, m, 1))?)?; // S x dout x M x din
        let lam = z_tr.broadcast_matmul(&weighted)?;

        let nzyz = nz.mul(&self.yz)?.reshape((1, dout, m, 1))?;
        let eta = z_tr.broadcast_matmul(&nzyz)?;

        NaturalNormal::new(eta, lam)
    }
}
