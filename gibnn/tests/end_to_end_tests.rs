mod common;

use candle_core::{DType, Device};
use common::{gi_clients, mfvi_clients, toy};
use gibnn::likelihood::Likelihood;
use gibnn::model::{Activation, Gibnn, Mfvi};
use gibnn::network::BayesianNetwork;
use gibnn::optimization::{LearningRates, OptimizerKind};
use gibnn::prior::{build_prior, PriorKind};
use gibnn::pvi::{run_pvi, EvalData, LocalOptConfig};
use gibnn::server::{Server, ServerKind};
use gibnn::RandomState;

fn local_config(local_iters: usize) -> LocalOptConfig {
    LocalOptConfig {
        local_iters,
        batch_size: 10,
        num_samples: 5,
        inference_samples: 5,
        optimizer: OptimizerKind::Adamw,
        rates: LearningRates::shared(0.01),
        log_step: 10,
        verbose: true,
    }
}

#[test]
fn one_sequential_pass_over_three_clients() -> anyhow::Result<()> {
    let dims = [1, 50, 1];
    let (key, data) = toy(RandomState::new(0), 60, 3)?;
    let (key, clients) = gi_clients(key, &data.parts, &dims, 2)?;
    let priors = build_prior(&dims, PriorKind::Neal, false, DType::F32, &Device::Cpu)?;

    let mut server = Server::new(ServerKind::Sequential, clients, 1)?;
    let likelihood = Likelihood::normal(0.1, DType::F32, &Device::Cpu)?;
    let mut network = BayesianNetwork::new(Gibnn::new(Activation::Relu), likelihood);
    let eval = EvalData {
        train: (&data.x_tr, &data.y_tr),
        test: (&data.x_te, &data.y_te),
    };

    run_pvi(key, &mut server, &mut network, &priors, &[], &eval, &local_config(3))?;

    assert_eq!(server.communications(), 6);
    assert_eq!(server.curr_iter(), 3);
    assert_eq!(server.optimized_clients().len(), 3);

    let mll = server.log().get("train_mll").ok_or(anyhow::anyhow!("no train_mll"))?;
    assert!(mll.last().is_some_and(|v| v.is_finite()));
    let comms = server.log().get("communications").ok_or(anyhow::anyhow!("no comms"))?;
    assert_eq!(comms.last().copied(), Some(6.0));
    assert!(server.log().get("test_rmse").is_some());

    for client in server.clients() {
        assert_eq!(client.log().get("vfe").map(|v| v.len()), Some(3));
    }
    Ok(())
}

#[test]
fn synchronous_mean_field_round_updates_everyone() -> anyhow::Result<()> {
    let dims = [1, 10, 1];
    let (key, data) = toy(RandomState::new(1), 40, 2)?;
    let (key, clients) = mfvi_clients(key, &data.parts, &dims)?;
    let priors = build_prior(&dims, PriorKind::Standard, false, DType::F32, &Device::Cpu)?;
    let before: Vec<Vec<f32>> = clients
        .iter()
        .map(|c| common::values(c.factors()[0].mean()))
        .collect::<anyhow::Result<_>>()?;

    let mut server = Server::new(ServerKind::Synchronous, clients, 2)?;
    let likelihood = Likelihood::normal(0.1, DType::F32, &Device::Cpu)?;
    let mut network = BayesianNetwork::new(Mfvi::new(Activation::Relu), likelihood);
    let eval = EvalData {
        train: (&data.x_tr, &data.y_tr),
        test: (&data.x_te, &data.y_te),
    };

    run_pvi(key, &mut server, &mut network, &priors, &[], &eval, &local_config(2))?;
    assert_eq!(server.communications(), 8);

    for (client, old) in server.clients().iter().zip(before) {
        assert_ne!(common::values(client.factors()[0].mean())?, old);
    }
    Ok(())
}

#[test]
fn zero_local_iterations_are_rejected() -> anyhow::Result<()> {
    let dims = [1, 4, 1];
    let (key, data) = toy(RandomState::new(2), 20, 1)?;
    let (key, clients) = mfvi_clients(key, &data.parts, &dims)?;
    let priors = build_prior(&dims, PriorKind::Standard, false, DType::F32, &Device::Cpu)?;
    let mut server = Server::new(ServerKind::Sequential, clients, 1)?;
    let likelihood = Likelihood::normal(0.1, DType::F32, &Device::Cpu)?;
    let mut network = BayesianNetwork::new(Mfvi::new(Activation::Relu), likelihood);
    let eval = EvalData {
        train: (&data.x_tr, &data.y_tr),
        test: (&data.x_te, &data.y_te),
    };
    assert!(run_pvi(key, &mut server, &mut network, &priors, &[], &eval, &local_config(0)).is_err());
    assert_eq!(server.communications(), 0);
    Ok(())
}
