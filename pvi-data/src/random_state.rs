use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

///
/// An explicit random-state token.
///
/// Every operation that consumes randomness takes the token by value
/// and hands back the advanced one, so two runs started from the same
/// seed with the same call sequence draw bit-identical numbers.
///
#[derive(Clone, Debug)]
pub struct RandomState {
    rng: StdRng,
}

impl RandomState {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw standard normal samples
    ///
    /// # Arguments
    /// * `shape` - shape of the returned tensor
    /// * `dtype` - target dtype
    /// * `device` - target device
    ///
    /// # Returns `(key, eps)`
    pub fn randn<S: Into<Shape>>(
        mut self,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<(Self, Tensor)> {
        let shape: Shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        let eps = Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)?;
        Ok((self, eps))
    }

    /// Draw uniform samples on `[lb, ub)`
    pub fn rand<S: Into<Shape>>(
        mut self,
        lb: f32,
        ub: f32,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<(Self, Tensor)> {
        let shape: Shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| lb + (ub - lb) * self.rng.random::<f32>())
            .collect();
        let u = Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)?;
        Ok((self, u))
    }

    /// A random permutation of `0..n`
    pub fn permutation(mut self, n: usize) -> (Self, Vec<usize>) {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(&mut self.rng);
        (self, perm)
    }

    /// Split off an independent token, e.g., to initialize a client
    /// without disturbing the main stream
    pub fn split(mut self) -> (Self, Self) {
        let seed: u64 = self.rng.random();
        (self, Self::new(seed))
    }
}
