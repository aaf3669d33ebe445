use crate::error::configuration;
use crate::factor::NaturalNormal;
use candle_core::{DType, Device};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Zero-mean isotropic weight priors
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorKind {
    /// unit variance
    Standard,
    /// variance `1 / din`, so that pre-activations keep unit scale
    Neal,
}

///
/// One prior per layer, matching the network `dims`
///
/// * `dims` - layer widths `[d0, d1, ..., dL]`
/// * `kind` - variance schedule
/// * `bias` - each layer also carries a bias column, so its weights
///   are (dout x din + 1); the variance schedule still uses `din`
///
pub fn build_prior(
    dims: &[usize],
    kind: PriorKind,
    bias: bool,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<Vec<NaturalNormal>> {
    if dims.len() < 2 || dims.contains(&0) {
        return Err(configuration(format!("invalid network dims {:?}", dims)));
    }
    dims.windows(2)
        .map(|w| {
            let (din, dout) = (w[0], w[1]);
            let precision = match kind {
                PriorKind::Standard => 1.0,
                PriorKind::Neal => din as f64,
            };
            let width = if bias { din + 1 } else { din };
            NaturalNormal::isotropic(dout, width, precision, dtype, device)
        })
        .collect()
}
