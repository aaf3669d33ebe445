use crate::error::configuration;
use crate::factor::NaturalNormal;
use crate::free_energy::estimate_local_vfe;
use crate::model::PosteriorModel;
use crate::network::BayesianNetwork;
use crate::optimization::{named_vars, ClientOptimizer, LearningRates, OptimizerKind};
use crate::server::Server;
use crate::store::{collect, collect_excluding, prior_view, FrozenSnapshot};
use candle_core::{DType, Tensor, Var};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info};
use pvi_data::minibatch::take_minibatch;
use pvi_data::RandomState;
use serde::{Deserialize, Serialize};

/// Settings of the local optimization each selected client runs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalOptConfig {
    /// optimizer steps per selection
    pub local_iters: usize,
    pub batch_size: usize,
    /// posterior draws per ELBO estimate
    pub num_samples: usize,
    /// posterior draws for evaluation
    pub inference_samples: usize,
    pub optimizer: OptimizerKind,
    pub rates: LearningRates,
    /// info-level logging every `log_step` local iterations
    pub log_step: usize,
    /// hide the progress bar
    pub verbose: bool,
}

/// Train and test splits used for the global evaluation
pub struct EvalData<'a> {
    pub train: (&'a Tensor, &'a Tensor),
    pub test: (&'a Tensor, &'a Tensor),
}

///
/// Sample the global posterior from a fully detached snapshot and log
/// its train and test performance
///
fn evaluate_global<M: PosteriorModel>(
    key: RandomState,
    server: &mut Server<M::Factor>,
    network: &mut BayesianNetwork<M>,
    priors: &[NaturalNormal],
    snapshot: &FrozenSnapshot<M::Factor>,
    data: &EvalData,
    num_samples: usize,
) -> anyhow::Result<RandomState> {
    let view = snapshot.to_view();
    let (key, _) = network
        .posterior
        .sample_posterior(key, priors, &view, num_samples)?;
    server.evaluate_performance(network, data.train, data.test)?;
    Ok(key)
}

///
/// Run partitioned variational inference to completion
///
/// Each round: freeze every client's factors, evaluate the global
/// posterior, then let each selected client maximize its local ELBO
/// with its own factors live and everyone else's frozen. In the very
/// first round a client only sees the prior and its own factors.
///
/// * `key` - random state token
/// * `server` - scheduler owning the clients
/// * `network` - posterior composition and likelihood
/// * `priors` - one prior per layer
/// * `likelihood_vars` - trainable likelihood parameters, optimized
///   along with every client
/// * `data` - global evaluation splits
/// * `config` - local optimization settings
///
/// # Returns the advanced token
pub fn run_pvi<M: PosteriorModel>(
    key: RandomState,
    server: &mut Server<M::Factor>,
    network: &mut BayesianNetwork<M>,
    priors: &[NaturalNormal],
    likelihood_vars: &[(String, Var)],
    data: &EvalData,
    config: &LocalOptConfig,
) -> anyhow::Result<RandomState> {
    if config.local_iters == 0 || config.batch_size == 0 {
        return Err(configuration("local_iters and batch_size must be positive"));
    }
    let n_total = data.train.0.dim(0)?;
    let log_step = config.log_step.max(1);

    let pb = ProgressBar::new(server.max_iters() as u64);
    if config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut key = key;
    while !server.is_done() {
        let round = server.curr_iter();
        let snapshot = collect(server.clients())?;
        key = evaluate_global(
            key,
            server,
            network,
            priors,
            &snapshot,
            data,
            config.inference_samples,
        )?;

        let selected = server.next_clients()?;
        for &c in selected.iter() {
            let client = &server.clients()[c];
            let name = client.name().to_string();
            let view = if round == 0 {
                prior_view(client)
            } else {
                collect_excluding(&snapshot, client)?
            };

            let mut vars = named_vars(client.varmap())?;
            vars.extend(likelihood_vars.iter().cloned());
            let mut optimizer = ClientOptimizer::new(vars, config.optimizer, &config.rates)?;

            let n_client = client.num_data();
            let batch_size = n_client.min(config.batch_size).min(n_total);
            let (x, y) = client.data();
            let (x, y) = (x.clone(), y.clone());

            let mut records = Vec::with_capacity(config.local_iters);
            for it in 0..config.local_iters {
                let (x_mb, y_mb) = take_minibatch(&x, &y, batch_size, it)?;
                let (next, vfe) = estimate_local_vfe(
                    key,
                    network,
                    &x_mb,
                    &y_mb,
                    priors,
                    &view,
                    config.num_samples,
                    n_client,
                )?;
                key = next;

                let loss = vfe.elbo.neg()?;
                optimizer.backward_step(&loss)?;

                let elbo = vfe.elbo.detach().to_dtype(DType::F32)?.to_scalar::<f32>()?;
                if it == 0 || (it + 1) % log_step == 0 || it + 1 == config.local_iters {
                    info!(
                        "[{}] round {} iter {}/{}: vfe {:.4}, ll {:.4}, kl {:.4}, error {:.4}",
                        name,
                        round,
                        it + 1,
                        config.local_iters,
                        elbo,
                        vfe.exp_ll,
                        vfe.kl,
                        vfe.error
                    );
                } else {
                    debug!("[{}] iter {}: vfe {:.4}", name, it + 1, elbo);
                }
                records.push((elbo, vfe.exp_ll, vfe.kl, vfe.error));
            }

            if let Some(client) = server.client_mut(c) {
                let log = client.log_mut();
                for (vfe, ll, kl, err) in records {
                    log.push("vfe", vfe as f64);
                    log.push("ll", ll as f64);
                    log.push("kl", kl as f64);
                    log.push("error", err as f64);
                }
            }
        }
        server.mark_optimized(&selected);
        pb.inc(1);
    }
    pb.finish_and_clear();

    let snapshot = collect(server.clients())?;
    key = evaluate_global(
        key,
        server,
        network,
        priors,
        &snapshot,
        data,
        config.inference_samples,
    )?;

    info!(
        "done after {} rounds and {} communications",
        server.curr_iter(),
        server.communications()
    );
    Ok(key)
}
