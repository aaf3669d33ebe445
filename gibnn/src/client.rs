use crate::error::configuration;
use crate::factor::{LayerFactor, MeanFieldFactor, PseudoObservation};
use crate::metrics::MetricsLog;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use pvi_data::RandomState;
use serde::{Deserialize, Serialize};

/// Initialization of a client's inducing inputs and pseudo observations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InducingInit {
    /// number of inducing points `M`
    pub num_inducing: usize,
    /// draw inducing inputs from N(0, 1) instead of the client's data
    pub random_z: bool,
    /// evenly spaced pseudo targets on [-1, 1] instead of N(0, 1)
    pub linspace_yz: bool,
    /// initial pseudo precision, one per layer (or one for all)
    pub nz_inits: Vec<f64>,
}

/// Initialization of a client's mean-field factors
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeanFieldInit {
    /// draw factor means from N(0, 1) instead of zeros
    pub random_mean: bool,
    /// initial factor precision, one per layer (or one for all)
    pub prec_inits: Vec<f64>,
    /// factors also cover a bias column of every layer
    #[serde(default)]
    pub bias: bool,
}

///
/// A data holder together with its trainable approximate-likelihood
/// factors, one per layer
///
/// Trainable tensors live in the client's own `VarMap` under
///
/// * `ts.{layer}.yz` - pseudo targets / factor means
/// * `ts.{layer}.nz` - log pseudo precisions / log factor precisions
/// * `zs.z` - inducing inputs
///
/// and the factors hold gradient-attached handles on them.
pub struct Client<F> {
    name: String,
    x: Tensor,
    y: Tensor,
    varmap: VarMap,
    factors: Vec<F>,
    inducing: Option<Tensor>,
    log: MetricsLog,
}

pub type GiClient = Client<PseudoObservation>;
pub type MfviClient = Client<MeanFieldFactor>;

/// Create a trainable variable from `init` and register it under `name`
pub(crate) fn register_var(varmap: &VarMap, name: &str, init: &Tensor) -> anyhow::Result<Tensor> {
    let var = Var::from_tensor(init)?;
    let tensor = var.as_tensor().clone();
    varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?
        .insert(name.to_string(), var);
    Ok(tensor)
}

/// Per-layer value from either one shared value or one per layer
fn per_layer(values: &[f64], num_layers: usize, what: &str) -> anyhow::Result<Vec<f64>> {
    match values.len() {
        1 => Ok(vec![values[0]; num_layers]),
        n if n == num_layers => Ok(values.to_vec()),
        n => Err(configuration(format!(
            "{} {} values for {} layers",
            n, what, num_layers
        ))),
    }
}

fn check_positive(values: &[f64], what: &str) -> anyhow::Result<()> {
    if values.iter().all(|v| v.is_finite() && *v > 0.0) {
        Ok(())
    } else {
        Err(configuration(format!("{} must be positive: {:?}", what, values)))
    }
}

fn check_data(x: &Tensor, y: &Tensor, dims: &[usize]) -> anyhow::Result<usize> {
    let (n, d_in) = x.dims2()?;
    let (n_y, d_out) = y.dims2()?;
    if n == 0 || n != n_y {
        return Err(configuration(format!("client data has {} inputs and {} targets", n, n_y)));
    }
    if dims.len() < 2 || dims[0] != d_in || dims[dims.len() - 1] != d_out {
        return Err(configuration(format!(
            "network dims {:?} do not fit data {} -> {}",
            dims, d_in, d_out
        )));
    }
    Ok(n)
}

fn linspace(m: usize, dtype: DType, device: &Device) -> anyhow::Result<Tensor> {
    let values: Vec<f32> = if m == 1 {
        vec![0.0]
    } else {
        (0..m).map(|i| -1.0 + 2.0 * i as f32 / (m - 1) as f32).collect()
    };
    Ok(Tensor::from_vec(values, m, device)?.to_dtype(dtype)?)
}

impl<F: LayerFactor> Client<F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `(x, y)` held by this client
    pub fn data(&self) -> (&Tensor, &Tensor) {
        (&self.x, &self.y)
    }

    pub fn num_data(&self) -> usize {
        self.x.dims().first().copied().unwrap_or(0)
    }

    pub fn num_layers(&self) -> usize {
        self.factors.len()
    }

    /// live factors, one per layer
    pub fn factors(&self) -> &[F] {
        &self.factors
    }

    /// live inducing inputs (M x d0), if this client has any
    pub fn inducing(&self) -> Option<&Tensor> {
        self.inducing.as_ref()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn log(&self) -> &MetricsLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut MetricsLog {
        &mut self.log
    }
}

impl Client<PseudoObservation> {
    ///
    /// Client with pseudo-observation factors at its own inducing inputs
    ///
    /// * `key` - random state token
    /// * `name` - unique client name
    /// * `x`, `y` - client data (n x d0), (n x dL)
    /// * `dims` - layer widths `[d0, ..., dL]`
    /// * `init` - inducing-point initialization
    ///
    pub fn new_gi(
        key: RandomState,
        name: &str,
        x: Tensor,
        y: Tensor,
        dims: &[usize],
        init: &InducingInit,
    ) -> anyhow::Result<(RandomState, Self)> {
        let n = check_data(&x, &y, dims)?;
        let m = init.num_inducing;
        if m == 0 {
            return Err(configuration("need at least one inducing point"));
        }
        let num_layers = dims.len() - 1;
        let nz_inits = per_layer(&init.nz_inits, num_layers, "nz_init")?;
        check_positive(&nz_inits, "pseudo precisions")?;

        let (dtype, device) = (x.dtype(), x.device().clone());
        let varmap = VarMap::new();

        let (mut key, z0) = if init.random_z {
            key.randn((m, dims[0]), dtype, &device)?
        } else {
            let (key, perm) = key.permutation(n);
            let rows: Vec<u32> = (0..m).map(|i| perm[i % n] as u32).collect();
            let rows = Tensor::from_vec(rows, m, &device)?;
            (key, x.index_select(&rows, 0)?.contiguous()?)
        };
        let z = register_var(&varmap, "zs.z", &z0)?;

        let mut factors = Vec::with_capacity(num_layers);
        for (i, &nz0) in nz_inits.iter().enumerate() {
            let dout = dims[i + 1];
            let yz0 = if init.linspace_yz {
                linspace(m, dtype, &device)?
                    .unsqueeze(0)?
                    .broadcast_as((dout, m))?
                    .contiguous()?
            } else {
                let (next, yz0) = key.randn((dout, m), dtype, &device)?;
                key = next;
                yz0
            };
            let ln_nz0 = Tensor::full(nz0.ln() as f32, (dout, m), &device)?.to_dtype(dtype)?;

            let yz = register_var(&varmap, &format!("ts.{}.yz", i), &yz0)?;
            let ln_nz = register_var(&varmap, &format!("ts.{}.nz", i), &ln_nz0)?;
            factors.push(PseudoObservation::new(yz, ln_nz)?);
        }

        Ok((
            key,
            Self {
                name: name.to_string(),
                x,
                y,
                varmap,
                factors,
                inducing: Some(z),
                log: MetricsLog::new(),
            },
        ))
    }
}

impl Client<MeanFieldFactor> {
    ///
    /// Client with fully factorized Gaussian factors
    ///
    /// * `key` - random state token
    /// * `name` - unique client name
    /// * `x`, `y` - client data (n x d0), (n x dL)
    /// * `dims` - layer widths `[d0, ..., dL]`
    /// * `init` - mean-field initialization
    ///
    pub fn new_mfvi(
        key: RandomState,
        name: &str,
        x: Tensor,
        y: Tensor,
        dims: &[usize],
        init: &MeanFieldInit,
    ) -> anyhow::Result<(RandomState, Self)> {
        check_data(&x, &y, dims)?;
        let num_layers = dims.len() - 1;
        let prec_inits = per_layer(&init.prec_inits, num_layers, "prec_init")?;
        check_positive(&prec_inits, "factor precisions")?;

        let (dtype, device) = (x.dtype(), x.device().clone());
        let varmap = VarMap::new();
        let mut key = key;

        let mut factors = Vec::with_capacity(num_layers);
        for (i, &prec0) in prec_inits.iter().enumerate() {
            let din = if init.bias { dims[i] + 1 } else { dims[i] };
            let dout = dims[i + 1];
            let mean0 = if init.random_mean {
                let (next, mean0) = key.randn((dout, din), dtype, &device)?;
                key = next;
                mean0
            } else {
                Tensor::zeros((dout, din), dtype, &device)?
            };
            let ln_prec0 = Tensor::full(prec0.ln() as f32, (dout, din), &device)?.to_dtype(dtype)?;

            let mean = register_var(&varmap, &format!("ts.{}.yz", i), &mean0)?;
            let ln_prec = register_var(&varmap, &format!("ts.{}.nz", i), &ln_prec0)?;
            factors.push(MeanFieldFactor::new(mean, ln_prec)?);
        }

        Ok((
            key,
            Self {
                name: name.to_string(),
                x,
                y,
                varmap,
                factors,
                inducing: None,
                log: MetricsLog::new(),
            },
        ))
    }
}
