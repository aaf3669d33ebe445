#![allow(dead_code)]

use candle_core::{Device, Tensor};
use gibnn::client::{GiClient, InducingInit, MeanFieldInit, MfviClient};
use gibnn::RandomState;
use pvi_data::dgp::{generate_data, Dgp};
use pvi_data::split::{equal_splits, split_data_clients};

pub struct Toy {
    pub x_tr: Tensor,
    pub y_tr: Tensor,
    pub x_te: Tensor,
    pub y_te: Tensor,
    pub parts: Vec<(Tensor, Tensor)>,
}

/// Ober toy regression split over `k` clients
pub fn toy(key: RandomState, n: usize, k: usize) -> anyhow::Result<(RandomState, Toy)> {
    let (key, data) = generate_data(key, Dgp::OberRegression, n, -4.0, 4.0)?;
    let (key, parts) = split_data_clients(key, &data.x_tr, &data.y_tr, &equal_splits(k))?;
    Ok((
        key,
        Toy {
            x_tr: data.x_tr,
            y_tr: data.y_tr,
            x_te: data.x_te,
            y_te: data.y_te,
            parts,
        },
    ))
}

pub fn gi_clients(
    key: RandomState,
    parts: &[(Tensor, Tensor)],
    dims: &[usize],
    num_inducing: usize,
) -> anyhow::Result<(RandomState, Vec<GiClient>)> {
    let init = InducingInit {
        num_inducing,
        random_z: false,
        linspace_yz: false,
        nz_inits: vec![1.0],
    };
    let mut key = key;
    let mut clients = vec![];
    for (i, (x, y)) in parts.iter().enumerate() {
        let (next, c) = GiClient::new_gi(key, &format!("client{}", i), x.clone(), y.clone(), dims, &init)?;
        key = next;
        clients.push(c);
    }
    Ok((key, clients))
}

pub fn mfvi_clients(
    key: RandomState,
    parts: &[(Tensor, Tensor)],
    dims: &[usize],
) -> anyhow::Result<(RandomState, Vec<MfviClient>)> {
    let init = MeanFieldInit {
        random_mean: true,
        prec_inits: vec![1.0],
        bias: false,
    };
    let mut key = key;
    let mut clients = vec![];
    for (i, (x, y)) in parts.iter().enumerate() {
        let (next, c) = MfviClient::new_mfvi(key, &format!("client{}", i), x.clone(), y.clone(), dims, &init)?;
        key = next;
        clients.push(c);
    }
    Ok((key, clients))
}

pub fn values(t: &Tensor) -> anyhow::Result<Vec<f32>> {
    Ok(t.detach().flatten_all()?.to_vec1::<f32>()?)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// `x` on `[-1, 1]` as an (n x 1) column
pub fn grid(n: usize) -> anyhow::Result<Tensor> {
    let step = 2.0 / (n.max(2) - 1) as f64;
    Ok(((Tensor::arange(0f32, n as f32, &Device::Cpu)? * step)? - 1.0)?.reshape((n, 1))?)
}
