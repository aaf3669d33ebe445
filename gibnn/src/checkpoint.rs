use crate::client::Client;
use crate::factor::LayerFactor;
use crate::optimization::named_vars;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use log::info;
use std::collections::HashMap;

/// Positive parameters are stored in log form while training and
/// exported in their constrained form
fn is_positive(name: &str) -> bool {
    name.contains("nz") || name.contains("output_var")
}

fn export_varmap(
    prefix: &str,
    varmap: &VarMap,
    out: &mut HashMap<String, Tensor>,
) -> anyhow::Result<()> {
    for (name, var) in named_vars(varmap)? {
        let raw = var.as_tensor().detach();
        let value = if is_positive(&name) { raw.exp()? } else { raw.copy()? };
        out.insert(format!("{}{}", prefix, name), value);
    }
    Ok(())
}

fn restore_varmap(
    prefix: &str,
    varmap: &VarMap,
    state: &HashMap<String, Tensor>,
) -> anyhow::Result<usize> {
    let mut restored = 0;
    for (name, var) in named_vars(varmap)? {
        let Some(value) = state.get(&format!("{}{}", prefix, name)) else {
            continue;
        };
        let value = value.to_device(var.device())?.to_dtype(var.dtype())?;
        let raw = if is_positive(&name) { value.log()? } else { value };
        var.set(&raw)?;
        restored += 1;
    }
    Ok(restored)
}

///
/// Flat map `{client}.{parameter}` -> constrained value for every
/// client, plus likelihood parameters under their own names
///
pub fn state_dict<F: LayerFactor>(
    clients: &[Client<F>],
    likelihood_vars: Option<&VarMap>,
) -> anyhow::Result<HashMap<String, Tensor>> {
    let mut out = HashMap::new();
    for client in clients {
        export_varmap(&format!("{}.", client.name()), client.varmap(), &mut out)?;
    }
    if let Some(varmap) = likelihood_vars {
        export_varmap("", varmap, &mut out)?;
    }
    Ok(out)
}

///
/// Load constrained values back into the clients' raw variables
///
/// Entries without a matching variable are ignored.
///
/// # Returns the number of variables restored
pub fn load_state_dict<F: LayerFactor>(
    clients: &[Client<F>],
    likelihood_vars: Option<&VarMap>,
    state: &HashMap<String, Tensor>,
) -> anyhow::Result<usize> {
    let mut restored = 0;
    for client in clients {
        restored += restore_varmap(&format!("{}.", client.name()), client.varmap(), state)?;
    }
    if let Some(varmap) = likelihood_vars {
        restored += restore_varmap("", varmap, state)?;
    }
    Ok(restored)
}

pub fn save(state: &HashMap<String, Tensor>, path: &str) -> anyhow::Result<()> {
    pvi_data::common_io::mkdir(path)?;
    candle_core::safetensors::save(state, path)?;
    info!("saved {} tensors to {}", state.len(), path);
    Ok(())
}

pub fn load(path: &str) -> anyhow::Result<HashMap<String, Tensor>> {
    Ok(candle_core::safetensors::load(path, &Device::Cpu)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_names() {
        assert!(is_positive("client0.ts.1.nz"));
        assert!(is_positive("output_var"));
        assert!(!is_positive("client0.ts.1.yz"));
        assert!(!is_positive("client0.zs.z"));
    }
}
