pub mod gibnn;
pub mod mfvi;

pub use gibnn::Gibnn;
pub use mfvi::Mfvi;

use crate::error::configuration;
use crate::factor::{LayerFactor, NaturalNormal};
use crate::store::PosteriorView;
use candle_core::{Tensor, D};
use clap::ValueEnum;
use pvi_data::RandomState;
use serde::{Deserialize, Serialize};

/// Hidden-layer nonlinearity
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Relu => x.relu(),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => candle_nn::ops::sigmoid(x),
        }
    }
}

///
/// Input of a layer: `h` itself, or `h` with a trailing column of ones
/// when the layer carries a bias
///
/// * `h` - activations (.. x din)
///
/// # Returns (.. x din) or (.. x din + 1)
pub fn layer_input(h: &Tensor, bias: bool) -> candle_core::Result<Tensor> {
    if !bias {
        return Ok(h.clone());
    }
    let mut dims = h.dims().to_vec();
    if let Some(last) = dims.last_mut() {
        *last = 1;
    }
    let ones = Tensor::ones(dims, h.dtype(), h.device())?;
    Tensor::cat(&[h, &ones], D::Minus1)
}

/// Weights drawn for one layer
#[derive(Clone, Debug)]
pub struct LayerSample {
    /// sampled weights (S x dout x din), one more column with a bias
    pub weights: Tensor,
    /// KL(q || p) of the layer's posterior (S)
    pub kl: Tensor,
}

/// Result of one posterior sampling pass
#[derive(Clone, Debug, Default)]
pub struct PosteriorCache {
    layers: Vec<LayerSample>,
}

impl PosteriorCache {
    pub fn new(layers: Vec<LayerSample>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[LayerSample] {
        &self.layers
    }

    pub fn num_samples(&self) -> anyhow::Result<usize> {
        let first = self
            .layers
            .first()
            .ok_or_else(|| configuration("empty posterior cache"))?;
        Ok(first.weights.dim(0)?)
    }

    ///
    /// Push inputs through every sampled network
    ///
    /// * `x` - inputs (N x d0), or already per sample (S x N x d0)
    /// * `activation` - nonlinearity between layers
    /// * `bias` - append a ones column to every layer's input
    ///
    /// # Returns outputs (S x N x dL)
    pub fn propagate(&self, x: &Tensor, activation: Activation, bias: bool) -> anyhow::Result<Tensor> {
        let s = self.num_samples()?;
        let mut h = match x.rank() {
            2 => {
                let (n, d) = x.dims2()?;
                x.unsqueeze(0)?.broadcast_as((s, n, d))?.contiguous()?
            }
            3 if x.dim(0)? == s => x.clone(),
            _ => {
                return Err(configuration(format!(
                    "cannot propagate inputs {:?} through {} samples",
                    x.dims(),
                    s
                )))
            }
        };
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer_input(&h, bias)?.matmul(&layer.weights.transpose(1, 2)?.contiguous()?)?;
            if i < last {
                h = activation.apply(&h)?;
            }
        }
        Ok(h)
    }

    /// Σ over layers of the per-layer KL (S)
    pub fn total_kl(&self) -> anyhow::Result<Tensor> {
        let mut layers = self.layers.iter();
        let first = layers
            .next()
            .ok_or_else(|| configuration("empty posterior cache"))?;
        let mut kl = first.kl.clone();
        for layer in layers {
            kl = (kl + &layer.kl)?;
        }
        Ok(kl)
    }
}

///
/// Composition of prior and client factors into a sampled posterior
///
/// Implementations combine, layer by layer, the prior with every
/// factor in a [`PosteriorView`], draw `S` weight samples and record
/// the per-layer KL to the prior. The last pass is kept for
/// [`PosteriorModel::propagate`] and [`PosteriorModel::total_kl`].
///
pub trait PosteriorModel {
    type Factor: LayerFactor;

    fn activation(&self) -> Activation;

    /// whether every layer carries a bias column
    fn bias(&self) -> bool;

    ///
    /// * `key` - random state token
    /// * `priors` - one prior per layer
    /// * `view` - client factors, at most one live
    /// * `num_samples` - number of posterior draws `S`
    ///
    fn sample_posterior(
        &mut self,
        key: RandomState,
        priors: &[NaturalNormal],
        view: &PosteriorView<Self::Factor>,
        num_samples: usize,
    ) -> anyhow::Result<(RandomState, PosteriorCache)>;

    /// cache of the most recent `sample_posterior`
    fn cache(&self) -> Option<&PosteriorCache>;

    /// Outputs (S x N x dL) of the most recently sampled networks
    fn propagate(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        self.cache()
            .ok_or_else(|| configuration("propagate before sample_posterior"))?
            .propagate(x, self.activation(), self.bias())
    }

    /// KL of the most recently sampled posterior (S)
    fn total_kl(&self) -> anyhow::Result<Tensor> {
        self.cache()
            .ok_or_else(|| configuration("total_kl before sample_posterior"))?
            .total_kl()
    }
}

/// Check that the view and priors agree on the number of layers
pub(crate) fn check_layers<F>(
    priors: &[NaturalNormal],
    view: &PosteriorView<F>,
) -> anyhow::Result<()> {
    if priors.is_empty() || priors.len() != view.num_layers() {
        return Err(configuration(format!(
            "{} priors for a view of {} layers",
            priors.len(),
            view.num_layers()
        )));
    }
    Ok(())
}

/// Turn a draw (S x dout x din x 1) into weights (S x dout x din)
pub(crate) fn squeeze_weights(w: Tensor) -> candle_core::Result<Tensor> {
    w.squeeze(D::Minus1)
}
