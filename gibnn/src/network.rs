use crate::likelihood::Likelihood;
use crate::model::PosteriorModel;
use candle_core::Tensor;

/// A Bayesian neural network: posterior composition plus an
/// observation model
pub struct BayesianNetwork<M> {
    pub posterior: M,
    pub likelihood: Likelihood,
}

impl<M: PosteriorModel> BayesianNetwork<M> {
    pub fn new(posterior: M, likelihood: Likelihood) -> Self {
        Self {
            posterior,
            likelihood,
        }
    }

    /// Outputs (S x N x dL) of the last sampled networks
    pub fn forward(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        self.posterior.propagate(x)
    }

    /// `E_q[log p(y | f)]` per sample, averaged over points (S)
    ///
    /// * `output` - network outputs (S x N x dL)
    /// * `target` - targets (N x dL)
    pub fn compute_expected_log_likelihood(
        &self,
        output: &Tensor,
        target: &Tensor,
    ) -> anyhow::Result<Tensor> {
        self.likelihood.expected_log_likelihood(output, target)
    }

    /// RMSE or misclassification rate of the sample-averaged prediction
    pub fn compute_error(&self, output: &Tensor, target: &Tensor) -> anyhow::Result<f32> {
        self.likelihood.error(output, target)
    }

    ///
    /// Marginal log-likelihood and predictive error of the last
    /// sampled networks
    ///
    /// # Returns `(mll, error)`
    pub fn performance_metrics(&self, x: &Tensor, y: &Tensor) -> anyhow::Result<(f32, f32)> {
        let out = self.forward(x)?.detach();
        let mll = self.likelihood.marginal_log_likelihood(&out, y)?;
        let err = self.compute_error(&out, y)?;
        Ok((mll, err))
    }
}
