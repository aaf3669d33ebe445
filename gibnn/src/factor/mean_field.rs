use crate::error::configuration;
use crate::factor::{Detach, LayerFactor, NaturalNormal};
use candle_core::{Result, Tensor};

/// Fully factorized Gaussian factor over a `dout x din` weight matrix
#[derive(Clone, Debug)]
pub struct MeanFieldFactor {
    /// factor means (dout x din)
    mean: Tensor,
    /// unconstrained precisions, `precision = exp(ln_prec)` (dout x din)
    ln_prec: Tensor,
}

impl MeanFieldFactor {
    pub fn new(mean: Tensor, ln_prec: Tensor) -> anyhow::Result<Self> {
        if mean.dims().len() != 2 || mean.dims() != ln_prec.dims() {
            return Err(configuration(format!(
                "mean-field factor disagrees: mean {:?}, ln_prec {:?}",
                mean.dims(),
                ln_prec.dims()
            )));
        }
        Ok(Self { mean, ln_prec })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn precision(&self) -> Result<Tensor> {
        self.ln_prec.exp()
    }
}

impl Detach for MeanFieldFactor {
    fn detached(&self) -> Result<Self> {
        Ok(Self {
            mean: self.mean.copy()?.detach(),
            ln_prec: self.ln_prec.copy()?.detach(),
        })
    }
}

impl LayerFactor for MeanFieldFactor {
    /// Diagonal natural parameters (dout x din x {din, 1}); inducing
    /// inputs are ignored
    fn natural_params(&self, _inducing: Option<&Tensor>) -> anyhow::Result<NaturalNormal> {
        NaturalNormal::from_mean_precision(&self.mean, &self.precision()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn diagonal_precision() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::new(&[[1f32, 2.]], &dev)?;
        let ln_prec = Tensor::new(&[[0f32, 3f32.ln()]], &dev)?;
        let nat = MeanFieldFactor::new(mean, ln_prec)?.natural_params(None)?;

        let lam: Vec<f32> = nat.lam().flatten_all()?.to_vec1()?;
        approx::assert_abs_diff_eq!(lam[0], 1.0, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(lam[1], 0.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(lam[3], 3.0, epsilon = 1e-5);

        let eta: Vec<f32> = nat.eta().flatten_all()?.to_vec1()?;
        approx::assert_abs_diff_eq!(eta[1], 6.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn detached_copy_is_independent() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let var = candle_core::Var::zeros((1, 2), DType::F32, &dev)?;
        let t = MeanFieldFactor::new(var.as_tensor().clone(), Tensor::zeros((1, 2), DType::F32, &dev)?)?;
        let frozen = t.detached()?;
        var.set(&Tensor::ones((1, 2), DType::F32, &dev)?)?;

        let live: Vec<f32> = t.mean().flatten_all()?.to_vec1()?;
        let kept: Vec<f32> = frozen.mean().flatten_all()?.to_vec1()?;
        assert_eq!(live, vec![1.0, 1.0]);
        assert_eq!(kept, vec![0.0, 0.0]);
        assert!(!frozen.mean().is_variable());
        Ok(())
    }
}
