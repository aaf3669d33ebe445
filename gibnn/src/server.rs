use crate::client::Client;
use crate::error::configuration;
use crate::factor::LayerFactor;
use crate::metrics::MetricsLog;
use crate::model::PosteriorModel;
use crate::network::BayesianNetwork;
use candle_core::Tensor;
use clap::ValueEnum;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which clients refine their factors in each round
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// every client, every round
    Synchronous,
    /// one client per round, round robin
    Sequential,
    /// one sequential pass over the clients, then every client per round
    Mixed,
}

#[derive(Clone, Debug)]
enum Schedule {
    Synchronous,
    Sequential { cursor: usize },
    Mixed { cursor: usize, global_iter: usize },
}

///
/// Round bookkeeping of partitioned inference
///
/// Owns the clients, decides who is optimized next, counts
/// communications (one message each way per selected client) and
/// keeps the global performance log.
///
pub struct Server<F> {
    kind: ServerKind,
    schedule: Schedule,
    clients: Vec<Client<F>>,
    curr_iter: usize,
    max_iters: usize,
    communications: usize,
    optimized_clients: BTreeSet<String>,
    log: MetricsLog,
}

impl<F: LayerFactor> Server<F> {
    ///
    /// * `kind` - scheduling policy
    /// * `clients` - clients with unique names
    /// * `iters` - global iterations (passes over the clients for
    ///   `Sequential`; ignored by `Mixed`)
    ///
    pub fn new(kind: ServerKind, clients: Vec<Client<F>>, iters: usize) -> anyhow::Result<Self> {
        let k = clients.len();
        if k == 0 {
            return Err(configuration("a server needs at least one client"));
        }
        let names: BTreeSet<&str> = clients.iter().map(|c| c.name()).collect();
        if names.len() != k {
            return Err(configuration("client names must be unique"));
        }

        let (schedule, max_iters) = match kind {
            ServerKind::Synchronous => (Schedule::Synchronous, iters),
            ServerKind::Sequential => (Schedule::Sequential { cursor: 0 }, iters * k),
            ServerKind::Mixed => (
                Schedule::Mixed {
                    cursor: 0,
                    global_iter: 0,
                },
                2 * k - 1,
            ),
        };

        info!("{:?} server over {} clients, {} rounds", kind, k, max_iters);

        Ok(Self {
            kind,
            schedule,
            clients,
            curr_iter: 0,
            max_iters,
            communications: 0,
            optimized_clients: BTreeSet::new(),
            log: MetricsLog::new(),
        })
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn curr_iter(&self) -> usize {
        self.curr_iter
    }

    pub fn max_iters(&self) -> usize {
        self.max_iters
    }

    pub fn communications(&self) -> usize {
        self.communications
    }

    pub fn is_done(&self) -> bool {
        self.curr_iter >= self.max_iters
    }

    pub fn clients(&self) -> &[Client<F>] {
        &self.clients
    }

    pub fn client_mut(&mut self, idx: usize) -> Option<&mut Client<F>> {
        self.clients.get_mut(idx)
    }

    pub fn log(&self) -> &MetricsLog {
        &self.log
    }

    /// names of clients optimized at least once
    pub fn optimized_clients(&self) -> &BTreeSet<String> {
        &self.optimized_clients
    }

    ///
    /// Select the clients to optimize this round and advance the round
    ///
    /// # Returns indices into [`Server::clients`]
    pub fn next_clients(&mut self) -> anyhow::Result<Vec<usize>> {
        if self.is_done() {
            return Err(configuration(format!(
                "all {} rounds are done",
                self.max_iters
            )));
        }
        let k = self.clients.len();
        let everyone: Vec<usize> = (0..k).collect();

        let selected = match &mut self.schedule {
            Schedule::Synchronous => everyone,
            Schedule::Sequential { cursor } => {
                let c = *cursor;
                *cursor = (c + 1) % k;
                vec![c]
            }
            Schedule::Mixed {
                cursor,
                global_iter,
            } => {
                *global_iter += 1;
                if *global_iter <= k {
                    let c = *cursor;
                    *cursor = (c + 1) % k;
                    vec![c]
                } else {
                    everyone
                }
            }
        };

        self.communications += 2 * selected.len();
        self.curr_iter += 1;
        Ok(selected)
    }

    /// Remember which clients have refined their factors
    pub fn mark_optimized(&mut self, selected: &[usize]) {
        for &c in selected {
            if let Some(client) = self.clients.get(c) {
                self.optimized_clients.insert(client.name().to_string());
            }
        }
    }

    ///
    /// Log train and test performance of the most recently sampled
    /// global posterior
    ///
    /// Appends `communications`, `iteration`, `train_mll`, `test_mll`
    /// and the likelihood's error for both splits.
    ///
    pub fn evaluate_performance<M: PosteriorModel<Factor = F>>(
        &mut self,
        network: &BayesianNetwork<M>,
        train: (&Tensor, &Tensor),
        test: (&Tensor, &Tensor),
    ) -> anyhow::Result<()> {
        let (train_mll, train_err) = network.performance_metrics(train.0, train.1)?;
        let (test_mll, test_err) = network.performance_metrics(test.0, test.1)?;
        let err_name = network.likelihood.error_name();

        self.log.push("communications", self.communications as f64);
        self.log.push("iteration", self.curr_iter as f64);
        self.log.push("train_mll", train_mll as f64);
        self.log.push(&format!("train_{}", err_name), train_err as f64);
        self.log.push("test_mll", test_mll as f64);
        self.log.push(&format!("test_{}", err_name), test_err as f64);

        info!(
            "round {}/{}, comms {}: train mll {:.4}, {} {:.4} | test mll {:.4}, {} {:.4}",
            self.curr_iter,
            self.max_iters,
            self.communications,
            train_mll,
            err_name,
            train_err,
            test_mll,
            err_name,
            test_err
        );
        Ok(())
    }
}
