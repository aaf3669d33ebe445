mod common;

use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use common::{gi_clients, grid, max_abs_diff, mfvi_clients, toy, values};
use gibnn::client::{MeanFieldInit, MfviClient};
use gibnn::factor::LayerFactor;
use gibnn::linalg::transpose_last;
use gibnn::model::{Activation, Gibnn, Mfvi, PosteriorModel};
use gibnn::prior::{build_prior, PriorKind};
use gibnn::store::{collect, prior_view};
use gibnn::RandomState;

#[test]
fn client_factors_commute() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(0), 30, 2)?;
    let (key, clients) = gi_clients(key, &data.parts, &[1, 6, 1], 4)?;
    let (_, z) = key.randn((3, 4, 1), DType::F32, &Device::Cpu)?;

    let a = clients[0].factors()[0].natural_params(Some(&z))?;
    let b = clients[1].factors()[0].natural_params(Some(&z))?;
    let ab = a.combine(&b)?;
    let ba = b.combine(&a)?;
    assert_abs_diff_eq!(max_abs_diff(ab.lam(), ba.lam())?, 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(max_abs_diff(ab.eta(), ba.eta())?, 0.0, epsilon = 1e-6);
    Ok(())
}

#[test]
fn single_client_mean_field_kl() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(1), 20, 1)?;
    let dims = [1, 5, 1];
    let (key, clients) = mfvi_clients(key, &data.parts, &dims)?;
    let priors = build_prior(&dims, PriorKind::Standard, false, DType::F32, &Device::Cpu)?;

    let mut model = Mfvi::new(Activation::Relu);
    let view = prior_view(&clients[0]);
    let (_, _) = model.sample_posterior(key, &priors, &view, 4)?;
    let total = values(&model.total_kl()?)?;

    let mut expected = vec![0f32; 4];
    for (prior, t) in priors.iter().zip(clients[0].factors()) {
        let q = prior.combine(&t.natural_params(None)?)?.with_samples(4)?;
        for (e, kl) in expected.iter_mut().zip(values(&q.kl_to(prior)?)?) {
            *e += kl;
        }
    }
    for (a, b) in total.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
    }
    Ok(())
}

#[test]
fn single_layer_inducing_kl() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(2), 20, 1)?;
    let dims = [1, 1];
    let (key, clients) = gi_clients(key, &data.parts, &dims, 3)?;
    let priors = build_prior(&dims, PriorKind::Neal, false, DType::F32, &Device::Cpu)?;

    let mut model = Gibnn::new(Activation::Relu);
    let (_, _) = model.sample_posterior(key, &priors, &collect(&clients)?.to_view(), 5)?;
    let total = values(&model.total_kl()?)?;

    let z = clients[0].inducing().ok_or(anyhow::anyhow!("no inducing inputs"))?;
    let z = z.detach().unsqueeze(0)?.broadcast_as((5, 3, 1))?.contiguous()?;
    let t = clients[0].factors()[0].natural_params(Some(&z))?;
    let kl = values(&priors[0].combine(&t)?.kl_to(&priors[0])?)?;

    assert_eq!(total.len(), 5);
    for (a, b) in total.iter().zip(kl.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
    }
    Ok(())
}

#[test]
fn propagate_matches_manual_chain() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(3), 30, 3)?;
    let dims = [1, 6, 4, 1];
    let (key, clients) = gi_clients(key, &data.parts, &dims, 2)?;
    let priors = build_prior(&dims, PriorKind::Neal, false, DType::F32, &Device::Cpu)?;

    let mut model = Gibnn::new(Activation::Tanh);
    let (_, cache) = model.sample_posterior(key, &priors, &collect(&clients)?.to_view(), 7)?;

    let x = grid(11)?;
    let out = model.propagate(&x)?;
    assert_eq!(out.dims(), &[7, 11, 1]);

    let mut h = x.unsqueeze(0)?.broadcast_as((7, 11, 1))?.contiguous()?;
    let last = cache.layers().len() - 1;
    for (i, layer) in cache.layers().iter().enumerate() {
        h = h.matmul(&layer.weights.transpose(1, 2)?.contiguous()?)?;
        if i < last {
            h = h.tanh()?;
        }
    }
    assert_eq!(max_abs_diff(&out, &h)?, 0.0);
    Ok(())
}

#[test]
fn inducing_outputs_follow_sampled_weights() -> anyhow::Result<()> {
    // a two-layer posterior conditions layer 2 on z propagated through layer 1
    let (key, data) = toy(RandomState::new(4), 20, 1)?;
    let dims = [1, 3, 1];
    let (key, clients) = gi_clients(key, &data.parts, &dims, 4)?;
    let priors = build_prior(&dims, PriorKind::Standard, false, DType::F32, &Device::Cpu)?;

    let mut model = Gibnn::new(Activation::Relu);
    let view = collect(&clients)?.to_view();
    let (_, cache) = model.sample_posterior(key, &priors, &view, 2)?;

    let z0 = clients[0].inducing().ok_or(anyhow::anyhow!("no inducing inputs"))?;
    let z0 = z0.detach().unsqueeze(0)?.broadcast_as((2, 4, 1))?.contiguous()?;
    let z1 = z0.matmul(&transpose_last(&cache.layers()[0].weights)?)?.relu()?;

    let t = clients[0].factors()[1].natural_params(Some(&z1))?;
    let q = priors[1].combine(&t)?;
    let kl = values(&q.kl_to(&priors[1])?)?;
    let cached = values(&cache.layers()[1].kl)?;
    for (a, b) in cached.iter().zip(kl.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
    }
    Ok(())
}

#[test]
fn same_key_same_posterior() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(5), 20, 2)?;
    let dims = [1, 4, 1];
    let (_, clients) = mfvi_clients(key, &data.parts, &dims)?;
    let priors = build_prior(&dims, PriorKind::Standard, false, DType::F32, &Device::Cpu)?;
    let view = collect(&clients)?.to_view();

    let mut model = Mfvi::new(Activation::Relu);
    let (_, a) = model.sample_posterior(RandomState::new(9), &priors, &view, 3)?;
    let (_, b) = model.sample_posterior(RandomState::new(9), &priors, &view, 3)?;
    for (la, lb) in a.layers().iter().zip(b.layers()) {
        assert_eq!(values(&la.weights)?, values(&lb.weights)?);
    }
    Ok(())
}

fn with_ones(h: &Tensor) -> anyhow::Result<Tensor> {
    let (s, n, _) = h.dims3()?;
    let ones = Tensor::ones((s, n, 1), h.dtype(), h.device())?;
    Ok(Tensor::cat(&[h, &ones], 2)?)
}

#[test]
fn bias_columns_enter_every_layer() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(6), 20, 1)?;
    let dims = [1, 5, 1];
    let (key, clients) = gi_clients(key, &data.parts, &dims, 3)?;
    let priors = build_prior(&dims, PriorKind::Neal, true, DType::F32, &Device::Cpu)?;

    let mut model = Gibnn::new(Activation::Tanh).with_bias(true);
    let (_, cache) = model.sample_posterior(key, &priors, &collect(&clients)?.to_view(), 4)?;
    assert_eq!(cache.layers()[0].weights.dims(), &[4, 5, 2]);
    assert_eq!(cache.layers()[1].weights.dims(), &[4, 1, 6]);

    // forward pass chained by hand
    let x = grid(9)?;
    let out = model.propagate(&x)?;
    let mut h = x.unsqueeze(0)?.broadcast_as((4, 9, 1))?.contiguous()?;
    for (i, layer) in cache.layers().iter().enumerate() {
        h = with_ones(&h)?.matmul(&layer.weights.transpose(1, 2)?.contiguous()?)?;
        if i == 0 {
            h = h.tanh()?;
        }
    }
    assert_eq!(out.dims(), &[4, 9, 1]);
    assert_eq!(max_abs_diff(&out, &h)?, 0.0);

    // the second layer's factor sees biased, propagated inducing inputs
    let z0 = clients[0].inducing().ok_or(anyhow::anyhow!("no inducing inputs"))?;
    let z0 = with_ones(&z0.detach().unsqueeze(0)?.broadcast_as((4, 3, 1))?.contiguous()?)?;
    let z1 = with_ones(&z0.matmul(&transpose_last(&cache.layers()[0].weights)?)?.tanh()?)?;
    let t = clients[0].factors()[1].natural_params(Some(&z1))?;
    let kl = values(&priors[1].combine(&t)?.kl_to(&priors[1])?)?;
    for (a, b) in values(&cache.layers()[1].kl)?.iter().zip(kl.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
    }
    Ok(())
}

#[test]
fn mean_field_bias_widens_weights() -> anyhow::Result<()> {
    let (_, data) = toy(RandomState::new(7), 20, 1)?;
    let dims = [1, 4, 1];
    let init = MeanFieldInit {
        random_mean: true,
        prec_inits: vec![1.0],
        bias: true,
    };
    let (x, y) = data.parts[0].clone();
    let (key, client) = MfviClient::new_mfvi(RandomState::new(8), "client0", x, y, &dims, &init)?;
    let priors = build_prior(&dims, PriorKind::Standard, true, DType::F32, &Device::Cpu)?;

    let mut model = Mfvi::new(Activation::Relu).with_bias(true);
    let (_, cache) = model.sample_posterior(key, &priors, &prior_view(&client), 3)?;
    assert_eq!(cache.layers()[0].weights.dims(), &[3, 4, 2]);
    assert_eq!(cache.layers()[1].weights.dims(), &[3, 1, 5]);
    assert_eq!(model.propagate(&grid(6)?)?.dims(), &[3, 6, 1]);
    Ok(())
}
