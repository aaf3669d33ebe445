mod common;

use candle_core::{DType, Tensor};
use common::{gi_clients, max_abs_diff, toy, values};
use gibnn::optimization::{named_vars, ClientOptimizer, LearningRates, OptimizerKind};
use gibnn::store::{collect, collect_excluding, Slot};
use gibnn::RandomState;

#[test]
fn excluding_keeps_others_frozen_and_active_live() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(0), 30, 3)?;
    let (_, clients) = gi_clients(key, &data.parts, &[1, 8, 1], 3)?;

    let snapshot = collect(&clients)?;
    let view = collect_excluding(&snapshot, &clients[1])?;

    for layer in 0..view.num_layers() {
        for c in 0..3 {
            let slot = view.slot(layer, c).ok_or(anyhow::anyhow!("missing slot"))?;
            let frozen = snapshot.factor(layer, c).ok_or(anyhow::anyhow!("missing factor"))?;
            match slot {
                Slot::Frozen(f) => {
                    assert_ne!(c, 1);
                    assert_eq!(values(f.get().yz())?, values(frozen.yz())?);
                    assert_eq!(values(&f.get().nz()?)?, values(&frozen.nz()?)?);
                    assert!(!f.get().yz().is_variable());
                }
                Slot::Live(l) => {
                    assert_eq!(c, 1);
                    let live = &clients[1].factors()[layer];
                    assert_eq!(l.get().yz().id(), live.yz().id());
                    assert!(l.get().yz().is_variable());
                }
            }
        }
    }
    Ok(())
}

#[test]
fn live_entry_shares_gradient_history() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(1), 30, 3)?;
    let (_, clients) = gi_clients(key, &data.parts, &[1, 8, 1], 3)?;
    let snapshot = collect(&clients)?;
    let view = collect_excluding(&snapshot, &clients[2])?;

    let mut loss = Tensor::zeros((), DType::F32, &candle_core::Device::Cpu)?;
    for (_, factor) in view.layer(0) {
        loss = (loss + factor.yz().sum_all()?)?;
    }
    let grads = loss.backward()?;

    assert!(grads.get(clients[2].factors()[0].yz()).is_some());
    assert!(grads.get(clients[0].factors()[0].yz()).is_none());
    assert!(grads.get(clients[1].factors()[0].yz()).is_none());
    Ok(())
}

#[test]
fn snapshot_survives_optimizer_step() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(2), 30, 3)?;
    let (_, clients) = gi_clients(key, &data.parts, &[1, 8, 1], 3)?;
    let snapshot = collect(&clients)?;
    let before = values(clients[0].factors()[0].yz())?;

    let mut opt = ClientOptimizer::new(
        named_vars(clients[0].varmap())?,
        OptimizerKind::Sgd,
        &LearningRates::shared(0.1),
    )?;
    let loss = clients[0].factors()[0].yz().sum_all()?;
    opt.backward_step(&loss)?;

    let frozen = snapshot.factor(0, 0).ok_or(anyhow::anyhow!("missing factor"))?;
    assert_eq!(values(frozen.yz())?, before);

    let after = values(clients[0].factors()[0].yz())?;
    for (a, b) in after.iter().zip(before.iter()) {
        approx::assert_abs_diff_eq!(*a, *b - 0.1, epsilon = 1e-6);
    }

    // other clients untouched
    let other = snapshot.factor(0, 1).ok_or(anyhow::anyhow!("missing factor"))?;
    assert_eq!(max_abs_diff(other.yz(), clients[1].factors()[0].yz())?, 0.0);
    Ok(())
}
