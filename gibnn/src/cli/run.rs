use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use clap::{Args, ValueEnum};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::checkpoint;
use crate::client::{Client, GiClient, InducingInit, MeanFieldInit, MfviClient};
use crate::error::configuration;
use crate::factor::NaturalNormal;
use crate::likelihood::Likelihood;
use crate::model::{Activation, Gibnn, Mfvi, PosteriorModel};
use crate::network::BayesianNetwork;
use crate::optimization::{named_vars, LearningRates, OptimizerKind};
use crate::prior::{build_prior, PriorKind};
use crate::pvi::{run_pvi, EvalData, LocalOptConfig};
use crate::server::{Server, ServerKind};
use pvi_data::dgp::{generate_blobs, generate_data, noise_std, Dgp};
use pvi_data::split::{equal_splits, split_data_clients};
use pvi_data::RandomState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// global inducing points
    Gi,
    /// mean field
    Mfvi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Regression,
    Classification,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, value_enum, default_value = "gi")]
    pub variant: Variant,

    #[arg(long, value_enum, default_value = "regression")]
    pub task: Task,

    #[arg(long, value_enum, default_value = "sequential")]
    pub server: ServerKind,

    #[arg(long, value_enum, default_value = "ober-regression", help = "Regression data generating process")]
    pub dgp: Dgp,

    #[arg(short = 'N', long, default_value = "40", help = "Number of training points")]
    pub num_data: usize,

    #[arg(long, default_value = "3", help = "Number of classes (classification)")]
    pub num_classes: usize,

    #[arg(long, value_delimiter = ',', default_value = "1,50,50,1", help = "Layer widths")]
    pub dims: Vec<usize>,

    #[arg(long, value_enum, default_value = "standard")]
    pub prior: PriorKind,

    #[arg(long, value_enum, default_value = "relu")]
    pub activation: Activation,

    #[arg(long, help = "Use bias vectors in the network")]
    pub bias: bool,

    #[arg(short = 'c', long, default_value = "3")]
    pub num_clients: usize,

    #[arg(long, value_delimiter = ',', help = "Fraction of the data per client (default: equal)")]
    pub splits: Option<Vec<f32>>,

    #[arg(short = 'M', long, default_value = "10", help = "Inducing points per client")]
    pub num_inducing: usize,

    #[arg(long, help = "Draw inducing inputs from N(0,1) instead of client data")]
    pub random_z: bool,

    #[arg(long, help = "Initialize pseudo targets on linspace(-1, 1)")]
    pub linspace_yz: bool,

    #[arg(long, help = "Draw mean-field factor means from N(0,1)")]
    pub random_mean_init: bool,

    #[arg(long, value_delimiter = ',', default_value = "1.0", help = "Initial factor precision per layer (or one for all)")]
    pub nz_inits: Vec<f64>,

    #[arg(short = 'S', long, default_value = "10", help = "Posterior samples per ELBO estimate")]
    pub training_samples: usize,

    #[arg(short = 'I', long, default_value = "50", help = "Posterior samples for evaluation")]
    pub inference_samples: usize,

    #[arg(short = 'g', long, default_value = "1")]
    pub global_iters: usize,

    #[arg(short = 'l', long, default_value = "1000")]
    pub local_iters: usize,

    #[arg(long, default_value = "40")]
    pub batch_size: usize,

    #[arg(long, value_enum, default_value = "adamw")]
    pub optimizer: OptimizerKind,

    #[arg(long, default_value = "0.01")]
    pub lr: f64,

    #[arg(long, help = "Separate learning rates for nz, yz, z and the output variance")]
    pub sep_lr: bool,

    #[arg(long, default_value = "0.01")]
    pub lr_nz: f64,

    #[arg(long, default_value = "0.01")]
    pub lr_yz: f64,

    #[arg(long, default_value = "0.01")]
    pub lr_z: f64,

    #[arg(long, default_value = "0.01", help = "Learning rate of a learnable output variance")]
    pub lr_output_var: f64,

    #[arg(long, help = "Observation noise variance (default: noise std / output scale)")]
    pub output_var: Option<f64>,

    #[arg(long, help = "Learn the observation noise (single client only)")]
    pub learn_output_var: bool,

    #[arg(short, long, default_value = "0")]
    pub seed: u64,

    #[arg(long, default_value = "100", help = "Info-level logging every n local iterations")]
    pub log_step: usize,

    #[arg(short, long, default_value = "results/gibnn", help = "Output directory")]
    pub output: PathBuf,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Validated run configuration, written next to the results
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PviConfig {
    pub variant: Variant,
    pub task: Task,
    pub server: ServerKind,
    pub dgp: Dgp,
    pub num_data: usize,
    pub dims: Vec<usize>,
    pub prior: PriorKind,
    pub activation: Activation,
    pub bias: bool,
    pub client_splits: Vec<f32>,
    pub inducing: InducingInit,
    pub mean_field: MeanFieldInit,
    pub global_iters: usize,
    pub local: LocalOptConfig,
    pub output_var: Option<f64>,
    pub learn_output_var: bool,
    pub seed: u64,
    pub output: PathBuf,
}

impl PviConfig {
    /// Check the arguments before any data is generated
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        let dims = args.dims.clone();
        if dims.len() < 2 || dims.contains(&0) {
            return Err(configuration(format!("invalid network dims {:?}", dims)));
        }
        let (d_in, d_out) = (dims[0], dims[dims.len() - 1]);
        match args.task {
            Task::Regression if d_in != 1 || d_out != 1 => {
                return Err(configuration(format!(
                    "regression data is one-dimensional, dims {:?}",
                    dims
                )));
            }
            Task::Classification if d_in < 2 || d_out != args.num_classes || d_out < 2 => {
                return Err(configuration(format!(
                    "classification needs >= 2 inputs and {} outputs, dims {:?}",
                    args.num_classes, dims
                )));
            }
            _ => {}
        }

        if args.num_clients == 0 {
            return Err(configuration("need at least one client"));
        }
        let client_splits = match &args.splits {
            Some(s) if s.len() != args.num_clients => {
                return Err(configuration(format!(
                    "{} splits for {} clients",
                    s.len(),
                    args.num_clients
                )));
            }
            Some(s) => s.clone(),
            None => equal_splits(args.num_clients),
        };

        if args.learn_output_var && args.task != Task::Regression {
            return Err(configuration("only regression has an output variance to learn"));
        }
        if args.learn_output_var && args.num_clients > 1 {
            return Err(configuration(
                "the output variance is shared by all clients and stays fixed with more than one",
            ));
        }
        if let Some(v) = args.output_var {
            if !(v.is_finite() && v > 0.0) {
                return Err(configuration(format!("output variance must be positive, got {}", v)));
            }
        }
        if args.training_samples == 0 || args.inference_samples == 0 {
            return Err(configuration("sample counts must be positive"));
        }
        if args.global_iters == 0 || args.local_iters == 0 || args.batch_size == 0 {
            return Err(configuration("iterations and batch size must be positive"));
        }

        Ok(Self {
            variant: args.variant,
            task: args.task,
            server: args.server,
            dgp: args.dgp,
            num_data: args.num_data,
            dims,
            prior: args.prior,
            activation: args.activation,
            bias: args.bias,
            client_splits,
            inducing: InducingInit {
                num_inducing: args.num_inducing,
                random_z: args.random_z,
                linspace_yz: args.linspace_yz,
                nz_inits: args.nz_inits.clone(),
            },
            mean_field: MeanFieldInit {
                random_mean: args.random_mean_init,
                prec_inits: args.nz_inits.clone(),
                bias: args.bias,
            },
            global_iters: args.global_iters,
            local: LocalOptConfig {
                local_iters: args.local_iters,
                batch_size: args.batch_size,
                num_samples: args.training_samples,
                inference_samples: args.inference_samples,
                optimizer: args.optimizer,
                rates: LearningRates {
                    lr: args.lr,
                    separate: args.sep_lr,
                    lr_nz: args.lr_nz,
                    lr_yz: args.lr_yz,
                    lr_z: args.lr_z,
                    lr_output_var: args.lr_output_var,
                },
                log_step: args.log_step,
                verbose: args.verbose,
            },
            output_var: args.output_var,
            learn_output_var: args.learn_output_var,
            seed: args.seed,
            output: args.output.clone(),
        })
    }

    pub fn to_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

struct TaskData {
    x_tr: Tensor,
    y_tr: Tensor,
    x_te: Tensor,
    y_te: Tensor,
    /// default observation noise variance on the standardized scale
    output_var: Option<f64>,
}

fn generate_task_data(key: RandomState, config: &PviConfig) -> Result<(RandomState, TaskData)> {
    match config.task {
        Task::Regression => {
            let (key, data) = generate_data(key, config.dgp, config.num_data, -4.0, 4.0)?;
            let output_var = (noise_std(config.dgp) / data.scale) as f64;
            Ok((
                key,
                TaskData {
                    x_tr: data.x_tr,
                    y_tr: data.y_tr,
                    x_te: data.x_te,
                    y_te: data.y_te,
                    output_var: Some(output_var),
                },
            ))
        }
        Task::Classification => {
            let (d_in, k) = (config.dims[0], config.dims[config.dims.len() - 1]);
            let (key, data) = generate_blobs(key, config.num_data, d_in, k)?;
            Ok((
                key,
                TaskData {
                    x_tr: data.x_tr,
                    y_tr: data.y_tr,
                    x_te: data.x_te,
                    y_te: data.y_te,
                    output_var: None,
                },
            ))
        }
    }
}

fn select_device(gpu: bool) -> Device {
    if !gpu {
        return Device::Cpu;
    }
    #[cfg(feature = "cuda")]
    {
        Device::new_cuda(0).unwrap_or(Device::Cpu)
    }
    #[cfg(all(feature = "metal", not(feature = "cuda")))]
    {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    {
        log::warn!("built without cuda/metal; using CPU");
        Device::Cpu
    }
}

fn output_file(dir: &Path, name: &str) -> Result<String> {
    dir.join(name)
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("invalid output path under {:?}", dir))
}

/// Everything a training run needs besides the clients
struct Experiment<'a> {
    config: &'a PviConfig,
    priors: Vec<NaturalNormal>,
    likelihood_vars: VarMap,
    data: TaskData,
}

impl Experiment<'_> {
    fn train_and_save<M: PosteriorModel>(
        &self,
        key: RandomState,
        clients: Vec<Client<M::Factor>>,
        mut network: BayesianNetwork<M>,
    ) -> Result<RandomState> {
        let config = self.config;
        let mut server = Server::new(config.server, clients, config.global_iters)?;
        let likelihood_vars = named_vars(&self.likelihood_vars)?;
        let eval = EvalData {
            train: (&self.data.x_tr, &self.data.y_tr),
            test: (&self.data.x_te, &self.data.y_te),
        };

        let key = run_pvi(
            key,
            &mut server,
            &mut network,
            &self.priors,
            &likelihood_vars,
            &eval,
            &config.local,
        )?;

        let out = &config.output;
        server.log().to_tsv(&output_file(out, "server_log.tsv")?)?;
        for client in server.clients() {
            client
                .log()
                .to_tsv(&output_file(out, &format!("{}_log.tsv", client.name()))?)?;
        }
        let state = checkpoint::state_dict(server.clients(), Some(&self.likelihood_vars))?;
        checkpoint::save(&state, &output_file(out, "model.safetensors")?)?;

        info!(
            "optimized clients: {:?}",
            server.optimized_clients().iter().collect::<Vec<_>>()
        );
        Ok(key)
    }
}

pub fn run(args: &RunArgs) -> Result<()> {
    let config = PviConfig::from_args(args)?;

    let device = select_device(args.gpu);
    info!("Using device: {:?}", device);

    std::fs::create_dir_all(&config.output)?;
    config.to_json(&config.output.join("config.json"))?;

    let key = RandomState::new(config.seed);
    let (key, data) = generate_task_data(key, &config)?;
    let data = TaskData {
        x_tr: data.x_tr.to_device(&device)?,
        y_tr: data.y_tr.to_device(&device)?,
        x_te: data.x_te.to_device(&device)?,
        y_te: data.y_te.to_device(&device)?,
        output_var: data.output_var,
    };

    let priors = build_prior(&config.dims, config.prior, config.bias, DType::F32, &device)?;

    let likelihood_vars = VarMap::new();
    let likelihood = match config.task {
        Task::Classification => Likelihood::categorical(),
        Task::Regression => {
            let var = config
                .output_var
                .or(data.output_var)
                .ok_or_else(|| configuration("no output variance"))?;
            info!("Likelihood variance: {:.4}", var);
            if config.learn_output_var {
                Likelihood::normal_learnable(&likelihood_vars, var, DType::F32, &device)?
            } else {
                Likelihood::normal(var, DType::F32, &device)?
            }
        }
    };

    let (key, parts) =
        split_data_clients(key, &data.x_tr, &data.y_tr, &config.client_splits)?;

    let experiment = Experiment {
        config: &config,
        priors,
        likelihood_vars,
        data,
    };

    match config.variant {
        Variant::Gi => {
            let mut key = key;
            let mut clients: Vec<GiClient> = Vec::with_capacity(parts.len());
            for (i, (x, y)) in parts.into_iter().enumerate() {
                let (next, c) =
                    GiClient::new_gi(key, &format!("client{}", i), x, y, &config.dims, &config.inducing)?;
                key = next;
                clients.push(c);
            }
            let model = Gibnn::new(config.activation).with_bias(config.bias);
            let network = BayesianNetwork::new(model, likelihood);
            experiment.train_and_save(key, clients, network)?;
        }
        Variant::Mfvi => {
            let mut key = key;
            let mut clients: Vec<MfviClient> = Vec::with_capacity(parts.len());
            for (i, (x, y)) in parts.into_iter().enumerate() {
                let (next, c) = MfviClient::new_mfvi(
                    key,
                    &format!("client{}", i),
                    x,
                    y,
                    &config.dims,
                    &config.mean_field,
                )?;
                key = next;
                clients.push(c);
            }
            let model = Mfvi::new(config.activation).with_bias(config.bias);
            let network = BayesianNetwork::new(model, likelihood);
            experiment.train_and_save(key, clients, network)?;
        }
    }

    info!("Results written to {:?}", config.output);
    Ok(())
}
