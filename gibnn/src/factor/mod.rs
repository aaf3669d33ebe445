pub mod mean_field;
pub mod natural_normal;
pub mod pseudo_obs;

pub use mean_field::MeanFieldFactor;
pub use natural_normal::NaturalNormal;
pub use pseudo_obs::PseudoObservation;

use candle_core::Tensor;

/// Deep copy that no longer participates in gradient computation
pub trait Detach: Sized {
    fn detached(&self) -> candle_core::Result<Self>;
}

impl Detach for Tensor {
    fn detached(&self) -> candle_core::Result<Self> {
        Ok(self.copy()?.detach())
    }
}

/// A client's contribution to one layer of the approximate posterior
pub trait LayerFactor: Detach + Clone {
    ///
    /// Natural parameters of this factor
    ///
    /// * `inducing` - the owning client's inducing inputs propagated to
    ///   this layer (S x M x din), for factors defined through them
    ///
    fn natural_params(&self, inducing: Option<&Tensor>) -> anyhow::Result<NaturalNormal>;
}
