use crate::error::{configuration, ensure_finite};
use crate::factor::NaturalNormal;
use crate::model::PosteriorModel;
use crate::network::BayesianNetwork;
use crate::store::PosteriorView;
use candle_core::{DType, Tensor};
use pvi_data::RandomState;

/// One Monte Carlo estimate of a client's local free energy
pub struct LocalFreeEnergy {
    /// scalar ELBO, attached to the live factors
    pub elbo: Tensor,
    /// sample-averaged expected log-likelihood per point
    pub exp_ll: f32,
    /// sample-averaged KL to the prior
    pub kl: f32,
    /// predictive error on the same batch
    pub error: f32,
}

fn scalar(t: &Tensor) -> anyhow::Result<f32> {
    Ok(t.detach().to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

///
/// Estimate the local ELBO of one client
///
/// ```text
/// elbo = mean_s [ E[ll](s) - KL(s) / N ]
/// ```
///
/// where `E[ll]` is averaged over the (mini)batch and `N` is the
/// client's dataset size.
///
/// * `key` - random state token
/// * `network` - posterior composition and likelihood
/// * `x`, `y` - batch inputs and targets
/// * `priors` - one prior per layer
/// * `view` - factors with the optimized client live
/// * `num_samples` - posterior draws `S`
/// * `num_data` - the client's dataset size `N`
///
/// Fails with `PviError::NumericInstability` if the KL or the expected
/// log-likelihood is not finite.
///
#[allow(clippy::too_many_arguments)]
pub fn estimate_local_vfe<M: PosteriorModel>(
    key: RandomState,
    network: &mut BayesianNetwork<M>,
    x: &Tensor,
    y: &Tensor,
    priors: &[NaturalNormal],
    view: &PosteriorView<M::Factor>,
    num_samples: usize,
    num_data: usize,
) -> anyhow::Result<(RandomState, LocalFreeEnergy)> {
    if num_data == 0 {
        return Err(configuration("the client holds no data"));
    }

    let (key, _) = network
        .posterior
        .sample_posterior(key, priors, view, num_samples)?;

    let out = network.forward(x)?;
    let kl = network.posterior.total_kl()?;
    let exp_ll = network.compute_expected_log_likelihood(&out, y)?;

    ensure_finite("KL", &kl)?;
    ensure_finite("expected log-likelihood", &exp_ll)?;

    let elbo = (&exp_ll - (&kl / num_data as f64)?)?.mean(0)?;
    let error = network.compute_error(&out, y)?;

    Ok((
        key,
        LocalFreeEnergy {
            exp_ll: scalar(&exp_ll.mean(0)?)?,
            kl: scalar(&kl.mean(0)?)?,
            error,
            elbo,
        },
    ))
}
