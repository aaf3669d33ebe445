use crate::random_state::RandomState;
use candle_core::{DType, Device, Tensor};
use clap::ValueEnum;
use log::info;
use serde::{Deserialize, Serialize};

/// Data generating processes for the toy experiments
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dgp {
    /// y = x^3 + N(0, 3^2) on two clusters x in [-4,-2] U [2,4]
    OberRegression,
    /// y = sin(x) + N(0, 0.1^2) on a single interval
    Sinusoid,
}

pub struct RegressionData {
    /// dense evaluation grid (n_grid x 1)
    pub x: Tensor,
    /// standardized noise-free response on the grid (n_grid x 1)
    pub y: Tensor,
    pub x_tr: Tensor,
    pub y_tr: Tensor,
    pub x_te: Tensor,
    pub y_te: Tensor,
    /// standard deviation used to standardize the response
    pub scale: f32,
}

const NUM_GRID: usize = 100;

fn ober_inputs(key: RandomState, n: usize, device: &Device) -> candle_core::Result<(RandomState, Tensor)> {
    let n_left = n / 2;
    let n_right = n - n_left;
    let (key, left) = key.rand(-4.0, -2.0, (n_left, 1), DType::F32, device)?;
    let (key, right) = key.rand(2.0, 4.0, (n_right, 1), DType::F32, device)?;
    Ok((key, Tensor::cat(&[left, right], 0)?))
}

fn response(dgp: Dgp, x: &Tensor) -> candle_core::Result<Tensor> {
    match dgp {
        Dgp::OberRegression => x.sqr()?.mul(x),
        Dgp::Sinusoid => x.sin(),
    }
}

/// standard deviation of the additive observation noise
pub fn noise_std(dgp: Dgp) -> f32 {
    match dgp {
        Dgp::OberRegression => 3.0,
        Dgp::Sinusoid => 0.1,
    }
}

///
/// Generate a toy regression dataset
///
/// The training response is standardized by its own standard
/// deviation (`scale`); the test set and the grid are divided by the
/// same scale so that all three live on one axis.
///
/// * `key` - random state token
/// * `dgp` - which generating process
/// * `n` - number of training points
/// * `xmin`, `xmax` - evaluation grid range
///
/// ```text
/// y(i) = f(x(i)) + sigma * eps(i),  eps(i) ~ N(0, 1)
/// ```
///
pub fn generate_data(
    key: RandomState,
    dgp: Dgp,
    n: usize,
    xmin: f32,
    xmax: f32,
) -> anyhow::Result<(RandomState, RegressionData)> {
    if n < 2 {
        anyhow::bail!("need at least two training points, got {}", n);
    }
    let device = Device::Cpu;
    let sigma = noise_std(dgp) as f64;

    let sample_inputs = |key: RandomState, n: usize| -> candle_core::Result<(RandomState, Tensor)> {
        match dgp {
            Dgp::OberRegression => ober_inputs(key, n, &device),
            Dgp::Sinusoid => key.rand(xmin, xmax, (n, 1), DType::F32, &device),
        }
    };

    let (key, x_tr) = sample_inputs(key, n)?;
    let (key, eps_tr) = key.randn((n, 1), DType::F32, &device)?;
    let y_tr = (response(dgp, &x_tr)? + (eps_tr * sigma)?)?;

    let (key, x_te) = sample_inputs(key, n)?;
    let (key, eps_te) = key.randn((n, 1), DType::F32, &device)?;
    let y_te = (response(dgp, &x_te)? + (eps_te * sigma)?)?;

    let step = (xmax - xmin) / (NUM_GRID - 1) as f32;
    let x = ((Tensor::arange(0u32, NUM_GRID as u32, &device)?.to_dtype(DType::F32)? * step as f64)?
        + xmin as f64)?
        .reshape((NUM_GRID, 1))?;
    let y = response(dgp, &x)?;

    let scale = y_tr.var_keepdim(0)?.sqrt()?.flatten_all()?.to_vec1::<f32>()?[0];
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let inv = 1.0 / scale as f64;

    info!("generated {:?} data: {} train/test points, scale {:.3}", dgp, n, scale);

    Ok((
        key,
        RegressionData {
            x,
            y: (y * inv)?,
            x_tr,
            y_tr: (y_tr * inv)?,
            x_te,
            y_te: (y_te * inv)?,
            scale,
        },
    ))
}

pub struct ClassificationData {
    pub x_tr: Tensor,
    /// one-hot targets (n x num_classes)
    pub y_tr: Tensor,
    pub x_te: Tensor,
    pub y_te: Tensor,
}

///
/// Gaussian blobs, one per class, with centers spread on a circle of
/// radius 2 in the first two coordinates
///
/// * `key` - random state token
/// * `n` - number of points per split
/// * `dim` - input dimension (at least 2)
/// * `num_classes` - number of blobs
///
pub fn generate_blobs(
    key: RandomState,
    n: usize,
    dim: usize,
    num_classes: usize,
) -> anyhow::Result<(RandomState, ClassificationData)> {
    if dim < 2 || num_classes < 2 {
        anyhow::bail!("blobs need dim >= 2 and at least 2 classes");
    }
    let device = Device::Cpu;

    let mut centers = vec![0f32; num_classes * dim];
    for c in 0..num_classes {
        let angle = 2.0 * std::f32::consts::PI * c as f32 / num_classes as f32;
        centers[c * dim] = 2.0 * angle.cos();
        centers[c * dim + 1] = 2.0 * angle.sin();
    }
    let centers = Tensor::from_vec(centers, (num_classes, dim), &device)?;
    let eye = Tensor::eye(num_classes, DType::F32, &device)?;

    let sample = |key: RandomState| -> anyhow::Result<(RandomState, Tensor, Tensor)> {
        let (key, perm) = key.permutation(n);
        let labels: Vec<u32> = perm.iter().map(|&i| (i % num_classes) as u32).collect();
        let labels = Tensor::from_vec(labels, n, &device)?;
        let (key, eps) = key.randn((n, dim), DType::F32, &device)?;
        let x = (centers.index_select(&labels, 0)? + (eps * 0.5)?)?;
        let y = eye.index_select(&labels, 0)?;
        Ok((key, x, y))
    };

    let (key, x_tr, y_tr) = sample(key)?;
    let (key, x_te, y_te) = sample(key)?;

    Ok((key, ClassificationData { x_tr, y_tr, x_te, y_te }))
}
