use crate::client::register_var;
use crate::error::configuration;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};
use candle_nn::VarMap;

const LN_2PI: f64 = 1.8378770664093453;

///
/// Observation model `p(y | f)` for network outputs `f`
///
/// * `Normal` - `y ~ N(f, σ²)` with `σ² = exp(ln_var)`
/// * `Categorical` - `y ~ Cat(softmax(f))` with one-hot targets
///
#[derive(Clone, Debug)]
pub enum Likelihood {
    Normal { ln_var: Tensor },
    Categorical,
}

impl Likelihood {
    /// Gaussian noise with fixed variance
    pub fn normal(output_var: f64, dtype: DType, device: &Device) -> anyhow::Result<Self> {
        if !(output_var.is_finite() && output_var > 0.0) {
            return Err(configuration(format!("output variance must be positive, got {}", output_var)));
        }
        let ln_var = Tensor::new(&[output_var.ln() as f32], device)?.to_dtype(dtype)?;
        Ok(Likelihood::Normal { ln_var })
    }

    /// Gaussian noise whose log variance is registered in `varmap` as
    /// `output_var`
    pub fn normal_learnable(
        varmap: &VarMap,
        output_var: f64,
        dtype: DType,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let Likelihood::Normal { ln_var } = Self::normal(output_var, dtype, device)? else {
            return Err(configuration("expected a normal likelihood"));
        };
        let ln_var = register_var(varmap, "output_var", &ln_var)?;
        Ok(Likelihood::Normal { ln_var })
    }

    pub fn categorical() -> Self {
        Likelihood::Categorical
    }

    /// name under which `error` is reported
    pub fn error_name(&self) -> &'static str {
        match self {
            Likelihood::Normal { .. } => "rmse",
            Likelihood::Categorical => "error",
        }
    }

    /// noise variance, if any
    pub fn output_var(&self) -> anyhow::Result<Option<f64>> {
        match self {
            Likelihood::Normal { ln_var } => {
                let v: Vec<f32> = ln_var.exp()?.to_dtype(DType::F32)?.to_vec1()?;
                Ok(v.first().map(|&x| x as f64))
            }
            Likelihood::Categorical => Ok(None),
        }
    }

    fn check_shapes(output: &Tensor, target: &Tensor) -> anyhow::Result<()> {
        let (o, t) = (output.dims(), target.dims());
        if o.len() != 3 || t.len() != 2 || o[1..] != t[..] {
            return Err(configuration(format!(
                "outputs {:?} do not match targets {:?}",
                o, t
            )));
        }
        Ok(())
    }

    ///
    /// Pointwise log-likelihood
    ///
    /// * `output` - network outputs (S x N x D)
    /// * `target` - targets (N x D); one-hot for `Categorical`
    ///
    /// # Returns (S x N)
    pub fn log_likelihood(&self, output: &Tensor, target: &Tensor) -> anyhow::Result<Tensor> {
        Self::check_shapes(output, target)?;
        match self {
            Likelihood::Normal { ln_var } => {
                let sq = output.broadcast_sub(target)?.sqr()?;
                let prec = ln_var.neg()?.exp()?;
                let ll = ((sq.broadcast_mul(&prec)?.broadcast_add(ln_var)? + LN_2PI)? * -0.5)?;
                Ok(ll.sum(D::Minus1)?)
            }
            Likelihood::Categorical => {
                let log_p = log_softmax(output, D::Minus1)?;
                Ok(log_p.broadcast_mul(target)?.sum(D::Minus1)?)
            }
        }
    }

    /// Expected log-likelihood per sample, averaged over points (S)
    pub fn expected_log_likelihood(&self, output: &Tensor, target: &Tensor) -> anyhow::Result<Tensor> {
        Ok(self.log_likelihood(output, target)?.mean(1)?)
    }

    ///
    /// Monte Carlo marginal log-likelihood averaged over points
    ///
    /// ```text
    /// mll = mean_n [ logsumexp_s ll(s, n) - ln S ]
    /// ```
    pub fn marginal_log_likelihood(&self, output: &Tensor, target: &Tensor) -> anyhow::Result<f32> {
        let ll = self.log_likelihood(output, target)?.detach();
        let s = ll.dim(0)? as f64;
        let max = ll.max_keepdim(0)?;
        let lse = (ll.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?.log()? + max)?;
        let mll = (lse - s.ln())?.mean_all()?;
        Ok(mll.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    ///
    /// Predictive error of the sample-averaged prediction
    ///
    /// * `Normal` - root mean squared error of the mean output
    /// * `Categorical` - misclassification rate of the mean class
    ///   probabilities
    pub fn error(&self, output: &Tensor, target: &Tensor) -> anyhow::Result<f32> {
        Self::check_shapes(output, target)?;
        let output = output.detach();
        let err = match self {
            Likelihood::Normal { .. } => {
                let mean = output.mean(0)?;
                (mean - target)?.sqr()?.mean_all()?.sqrt()?
            }
            Likelihood::Categorical => {
                let probs = softmax(&output, D::Minus1)?.mean(0)?;
                let hits = probs
                    .argmax(D::Minus1)?
                    .eq(&target.argmax(D::Minus1)?)?
                    .to_dtype(DType::F32)?
                    .mean_all()?;
                (hits.neg()? + 1.0)?
            }
        };
        Ok(err.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }
}
