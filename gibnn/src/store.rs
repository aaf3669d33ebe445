//! Freezing protocol over client factors.
//!
//! A [`Frozen`] value is a deep copy with no gradient history; a
//! [`Live`] value is a handle on a client's trainable tensors. Posterior
//! composition only ever sees a [`PosteriorView`], an arena indexed
//! by `[layer][client]` in which at most one client is live.

use crate::client::Client;
use crate::error::{configuration, PviError};
use crate::factor::{Detach, LayerFactor};
use candle_core::Tensor;

/// Detached snapshot of a value; gradients never reach its source
#[derive(Clone, Debug)]
pub struct Frozen<T>(T);

/// Gradient-attached handle on a client's current parameters
#[derive(Clone, Debug)]
pub struct Live<T>(T);

impl<T: Detach> Frozen<T> {
    pub fn capture(value: &T) -> candle_core::Result<Self> {
        Ok(Self(value.detached()?))
    }
}

impl<T> Frozen<T> {
    pub fn get(&self) -> &T {
        &self.0
    }
}

impl<T> Live<T> {
    pub fn get(&self) -> &T {
        &self.0
    }
}

#[derive(Clone, Debug)]
pub enum Slot<T> {
    Frozen(Frozen<T>),
    Live(Live<T>),
}

impl<T> Slot<T> {
    pub fn value(&self) -> &T {
        match self {
            Slot::Frozen(x) => x.get(),
            Slot::Live(x) => x.get(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Slot::Live(_))
    }
}

/// Frozen copies of every client's factors and inducing inputs
#[derive(Clone, Debug)]
pub struct FrozenSnapshot<F> {
    clients: Vec<String>,
    /// [layer][client]
    factors: Vec<Vec<Frozen<F>>>,
    /// [client]
    inducing: Vec<Option<Frozen<Tensor>>>,
}

/// Factors as seen by posterior composition: frozen entries plus at
/// most one live client
#[derive(Clone, Debug)]
pub struct PosteriorView<F> {
    clients: Vec<String>,
    /// [layer][client]
    factors: Vec<Vec<Slot<F>>>,
    /// [client]
    inducing: Vec<Option<Slot<Tensor>>>,
}

///
/// Snapshot the current factors of all clients
///
/// The result is unaffected by any later optimizer step on any client.
///
pub fn collect<F: LayerFactor>(clients: &[Client<F>]) -> anyhow::Result<FrozenSnapshot<F>> {
    let num_layers = clients.first().map(|c| c.num_layers()).unwrap_or(0);
    if clients.iter().any(|c| c.num_layers() != num_layers) {
        return Err(configuration("clients disagree on the number of layers"));
    }

    let mut factors = Vec::with_capacity(num_layers);
    for layer in 0..num_layers {
        let row = clients
            .iter()
            .map(|c| Frozen::capture(&c.factors()[layer]))
            .collect::<candle_core::Result<Vec<_>>>()?;
        factors.push(row);
    }

    let inducing = clients
        .iter()
        .map(|c| c.inducing().map(Frozen::capture).transpose())
        .collect::<candle_core::Result<Vec<_>>>()?;

    Ok(FrozenSnapshot {
        clients: clients.iter().map(|c| c.name().to_string()).collect(),
        factors,
        inducing,
    })
}

///
/// Snapshot in which `active`'s entries are replaced by its live
/// factors; everyone else stays frozen
///
/// Fails with `PviError::UnknownClient` if `active` is not part of the
/// snapshot.
///
pub fn collect_excluding<F: LayerFactor>(
    snapshot: &FrozenSnapshot<F>,
    active: &Client<F>,
) -> anyhow::Result<PosteriorView<F>> {
    let idx = snapshot
        .clients
        .iter()
        .position(|c| c == active.name())
        .ok_or_else(|| PviError::UnknownClient(active.name().to_string()))?;
    if active.num_layers() != snapshot.num_layers() {
        return Err(configuration(format!(
            "client {} has {} layers, snapshot has {}",
            active.name(),
            active.num_layers(),
            snapshot.num_layers()
        )));
    }

    let mut view = snapshot.to_view();
    for (layer, row) in view.factors.iter_mut().enumerate() {
        row[idx] = Slot::Live(Live(active.factors()[layer].clone()));
    }
    view.inducing[idx] = active.inducing().map(|z| Slot::Live(Live(z.clone())));
    Ok(view)
}

/// View that holds only `active`'s live factors
pub fn prior_view<F: LayerFactor>(active: &Client<F>) -> PosteriorView<F> {
    PosteriorView {
        clients: vec![active.name().to_string()],
        factors: active
            .factors()
            .iter()
            .map(|f| vec![Slot::Live(Live(f.clone()))])
            .collect(),
        inducing: vec![active.inducing().map(|z| Slot::Live(Live(z.clone())))],
    }
}

impl<F: Clone> FrozenSnapshot<F> {
    pub fn clients(&self) -> &[String] {
        &self.clients
    }

    pub fn num_layers(&self) -> usize {
        self.factors.len()
    }

    pub fn factor(&self, layer: usize, client: usize) -> Option<&F> {
        self.factors.get(layer)?.get(client).map(|f| f.get())
    }

    /// All-frozen view, e.g., for evaluation
    pub fn to_view(&self) -> PosteriorView<F> {
        PosteriorView {
            clients: self.clients.clone(),
            factors: self
                .factors
                .iter()
                .map(|row| row.iter().cloned().map(Slot::Frozen).collect())
                .collect(),
            inducing: self
                .inducing
                .iter()
                .map(|z| z.clone().map(Slot::Frozen))
                .collect(),
        }
    }
}

impl<F> PosteriorView<F> {
    pub fn clients(&self) -> &[String] {
        &self.clients
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn num_layers(&self) -> usize {
        self.factors.len()
    }

    /// `(client index, factor)` pairs contributing to `layer`
    pub fn layer(&self, layer: usize) -> impl Iterator<Item = (usize, &F)> + '_ {
        self.factors
            .get(layer)
            .into_iter()
            .flat_map(|row| row.iter().map(|s| s.value()).enumerate())
    }

    pub fn slot(&self, layer: usize, client: usize) -> Option<&Slot<F>> {
        self.factors.get(layer)?.get(client)
    }

    /// inducing inputs (M x d0) of each client, in client order
    pub fn inducing_inputs(&self) -> impl Iterator<Item = Option<&Tensor>> + '_ {
        self.inducing.iter().map(|z| z.as_ref().map(|s| s.value()))
    }

    /// name of the client whose factors are live, if any
    pub fn live_client(&self) -> Option<&str> {
        let row = self.factors.first()?;
        row.iter()
            .position(|s| s.is_live())
            .map(|i| self.clients[i].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InducingInit, GiClient};
    use candle_core::Device;
    use pvi_data::RandomState;

    fn clients(k: usize) -> anyhow::Result<Vec<GiClient>> {
        let x = Tensor::arange(0f32, 6f32, &Device::Cpu)?.reshape((6, 1))?;
        let init = InducingInit {
            num_inducing: 2,
            random_z: false,
            linspace_yz: false,
            nz_inits: vec![1.0],
        };
        let mut key = RandomState::new(0);
        let mut out = vec![];
        for i in 0..k {
            let (next, c) = GiClient::new_gi(key, &format!("client{}", i), x.clone(), x.clone(), &[1, 3, 1], &init)?;
            key = next;
            out.push(c);
        }
        Ok(out)
    }

    #[test]
    fn exactly_one_live_client() -> anyhow::Result<()> {
        let cs = clients(3)?;
        let snapshot = collect(&cs)?;
        assert!(snapshot.to_view().live_client().is_none());

        let view = collect_excluding(&snapshot, &cs[1])?;
        assert_eq!(view.live_client(), Some("client1"));
        for layer in 0..view.num_layers() {
            let live: Vec<bool> = (0..3)
                .map(|c| view.slot(layer, c).map(|s| s.is_live()).unwrap_or(false))
                .collect();
            assert_eq!(live, vec![false, true, false]);
        }
        Ok(())
    }

    #[test]
    fn unknown_client_is_rejected() -> anyhow::Result<()> {
        let cs = clients(3)?;
        let snapshot = collect(&cs[..2])?;
        let err = collect_excluding(&snapshot, &cs[2]).unwrap_err();
        assert!(matches!(err.downcast_ref::<PviError>(), Some(PviError::UnknownClient(_))));
        Ok(())
    }

    #[test]
    fn prior_view_holds_only_the_active_client() -> anyhow::Result<()> {
        let cs = clients(2)?;
        let view = prior_view(&cs[0]);
        assert_eq!(view.clients(), &["client0".to_string()]);
        assert_eq!(view.layer(0).count(), 1);
        assert_eq!(view.live_client(), Some("client0"));
        Ok(())
    }
}
