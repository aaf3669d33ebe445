use crate::error::configuration;
use crate::factor::{LayerFactor, NaturalNormal, PseudoObservation};
use crate::linalg::transpose_last;
use crate::model::{
    check_layers, layer_input, squeeze_weights, Activation, LayerSample, PosteriorCache, PosteriorModel,
};
use crate::store::PosteriorView;
use candle_core::Tensor;
use log::debug;
use pvi_data::RandomState;

///
/// Global inducing-point posterior
///
/// Layer by layer, every client's pseudo observations are evaluated at
/// that client's inducing inputs propagated through the weights drawn
/// for the previous layers:
///
/// ```text
/// q_l(W_l | U_{<l}) ∝ p_l(W_l) Π_c t_{c,l}(W_l; U_{c,l-1})
/// U_{c,l} = φ(U_{c,l-1} W_lᵀ)   (no φ after the last layer)
/// ```
///
/// With a bias, `U_{c,l-1}` gains a column of ones before it meets
/// `W_l`, both in the factor and in the propagation.
///
pub struct Gibnn {
    activation: Activation,
    bias: bool,
    cache: Option<PosteriorCache>,
}

impl Gibnn {
    pub fn new(activation: Activation) -> Self {
        Self {
            activation,
            bias: false,
            cache: None,
        }
    }

    /// Give every layer a bias column; priors and factors must be
    /// sized (dout x din + 1) to match
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Tile inducing inputs (M x d0) to (S x M x d0)
fn tile_samples(z: &Tensor, num_samples: usize) -> anyhow::Result<Tensor> {
    let (m, d) = z.dims2()?;
    Ok(z.unsqueeze(0)?
        .broadcast_as((num_samples, m, d))?
        .contiguous()?)
}

impl PosteriorModel for Gibnn {
    type Factor = PseudoObservation;

    fn activation(&self) -> Activation {
        self.activation
    }

    fn bias(&self) -> bool {
        self.bias
    }

    fn sample_posterior(
        &mut self,
        key: RandomState,
        priors: &[NaturalNormal],
        view: &PosteriorView<PseudoObservation>,
        num_samples: usize,
    ) -> anyhow::Result<(RandomState, PosteriorCache)> {
        check_layers(priors, view)?;
        if num_samples == 0 {
            return Err(configuration("need at least one posterior sample"));
        }

        let mut inducing: Vec<Option<Tensor>> = view
            .inducing_inputs()
            .map(|z| z.map(|z| tile_samples(z, num_samples)).transpose())
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut key = key;
        let last = priors.len() - 1;
        let mut layers = Vec::with_capacity(priors.len());

        for (l, prior) in priors.iter().enumerate() {
            for z in inducing.iter_mut().flatten() {
                *z = layer_input(z, self.bias)?;
            }

            let mut q = prior.clone();
            for (c, factor) in view.layer(l) {
                let z = inducing[c].as_ref().ok_or_else(|| {
                    configuration(format!("client {} has no inducing inputs", view.clients()[c]))
                })?;
                q = q.combine(&factor.natural_params(Some(z))?)?;
            }
            let q = q.with_samples(num_samples)?;

            let (next, w) = q.sample(key)?;
            key = next;
            let kl = q.kl_to(prior)?;
            let weights = squeeze_weights(w)?;

            let w_tr = transpose_last(&weights)?;
            for z in inducing.iter_mut().flatten() {
                let u = z.matmul(&w_tr)?;
                *z = if l < last { self.activation.apply(&u)? } else { u };
            }

            debug!("layer {}: weights {:?}", l, weights.dims());
            layers.push(LayerSample { weights, kl });
        }

        let cache = PosteriorCache::new(layers);
        self.cache = Some(cache.clone());
        Ok((key, cache))
    }

    fn cache(&self) -> Option<&PosteriorCache> {
        self.cache.as_ref()
    }
}
