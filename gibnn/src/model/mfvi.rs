use crate::error::configuration;
use crate::factor::{LayerFactor, MeanFieldFactor, NaturalNormal};
use crate::model::{check_layers, squeeze_weights, Activation, LayerSample, PosteriorCache, PosteriorModel};
use crate::store::PosteriorView;
use pvi_data::RandomState;

/// Mean-field posterior: per-layer product of the prior with every
/// client's diagonal factor, independent across layers
pub struct Mfvi {
    activation: Activation,
    bias: bool,
    cache: Option<PosteriorCache>,
}

impl Mfvi {
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

impl PosteriorModel for Mfvi {
    type Factor = MeanFieldFactor;

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
        view: &PosteriorView<MeanFieldFactor>,
        num_samples: usize,
    ) -> anyhow::Result<(RandomState, PosteriorCache)> {
        check_layers(priors, view)?;
        if num_samples == 0 {
            return Err(configuration("need at least one posterior sample"));
        }

        let mut key = key;
        let mut layers = Vec::with_capacity(priors.len());
        for (l, prior) in priors.iter().enumerate() {
            let mut q = prior.clone();
            for (_, factor) in view.layer(l) {
                q = q.combine(&factor.natural_params(None)?)?;
            }
            let q = q.with_samples(num_samples)?;

            let (next, w) = q.sample(key)?;
            key = next;
            let kl = q.kl_to(prior)?;
            layers.push(LayerSample {
                weights: squeeze_weights(w)?,
                kl,
            });
        }

        let cache = PosteriorCache::new(layers);
        self.cache = Some(cache.clone());
        Ok((key, cache))
    }

    fn cache(&self) -> Option<&PosteriorCache> {
        self.cache.as_ref()
    }
}
