use crate::error::configuration;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adamw,
    Sgd,
}

/// Learning rates; group rates take effect with `separate`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LearningRates {
    pub lr: f64,
    pub separate: bool,
    pub lr_nz: f64,
    pub lr_yz: f64,
    pub lr_z: f64,
    /// rate of a learnable likelihood variance
    #[serde(default = "default_lr")]
    pub lr_output_var: f64,
}

fn default_lr() -> f64 {
    1e-2
}

impl LearningRates {
    pub fn shared(lr: f64) -> Self {
        Self {
            lr,
            separate: false,
            lr_nz: lr,
            lr_yz: lr,
            lr_z: lr,
            lr_output_var: lr,
        }
    }
}

enum Stepper {
    Adam(AdamW),
    Sgd(SGD),
}

impl Stepper {
    fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64) -> candle_core::Result<Self> {
        match kind {
            OptimizerKind::Adamw => {
                let params = ParamsAdamW {
                    lr,
                    weight_decay: 0.,
                    ..Default::default()
                };
                Ok(Stepper::Adam(AdamW::new(vars, params)?))
            }
            OptimizerKind::Sgd => Ok(Stepper::Sgd(SGD::new(vars, lr)?)),
        }
    }

    fn step(&mut self, grads: &candle_core::backprop::GradStore) -> candle_core::Result<()> {
        match self {
            Stepper::Adam(opt) => opt.step(grads),
            Stepper::Sgd(opt) => opt.step(grads),
        }
    }
}

/// Parameter group of a variable, by its registered name
fn group_of(name: &str) -> &'static str {
    if name.contains("output_var") {
        "output_var"
    } else if name.starts_with("zs.") {
        "z"
    } else if name.ends_with(".nz") {
        "nz"
    } else {
        "yz"
    }
}

///
/// Optimizer over one client's variables (plus any trainable
/// likelihood parameters), possibly split into groups with their own
/// learning rates
///
pub struct ClientOptimizer {
    groups: Vec<Stepper>,
}

impl ClientOptimizer {
    ///
    /// * `named_vars` - `(name, var)` pairs, e.g., from a client's
    ///   `VarMap`
    /// * `kind` - update rule
    /// * `rates` - learning rates
    ///
    pub fn new(
        named_vars: Vec<(String, Var)>,
        kind: OptimizerKind,
        rates: &LearningRates,
    ) -> anyhow::Result<Self> {
        if named_vars.is_empty() {
            return Err(configuration("nothing to optimize"));
        }

        let mut groups = vec![];
        if rates.separate {
            let rated = [
                ("nz", rates.lr_nz),
                ("yz", rates.lr_yz),
                ("z", rates.lr_z),
                ("output_var", rates.lr_output_var),
            ];
            for (group, lr) in rated {
                let vars: Vec<Var> = named_vars
                    .iter()
                    .filter(|(name, _)| group_of(name) == group)
                    .map(|(_, v)| v.clone())
                    .collect();
                if !vars.is_empty() {
                    groups.push(Stepper::new(kind, vars, lr)?);
                }
            }
        } else {
            let vars = named_vars.into_iter().map(|(_, v)| v).collect();
            groups.push(Stepper::new(kind, vars, rates.lr)?);
        }
        Ok(Self { groups })
    }

    /// Back-propagate `loss` once and update every group
    pub fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        let grads = loss.backward()?;
        for g in self.groups.iter_mut() {
            g.step(&grads)?;
        }
        Ok(())
    }
}

/// `(name, var)` pairs registered in a `VarMap`, sorted by name
pub fn named_vars(varmap: &candle_nn::VarMap) -> anyhow::Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let mut out: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
