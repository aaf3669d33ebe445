use crate::random_state::RandomState;
use candle_core::{Device, Tensor};
use log::info;

///
/// Partition a dataset into disjoint client shards
///
/// Rows are shuffled once with the random-state token and then cut
/// into contiguous chunks whose sizes follow the fractional `splits`.
/// The last client absorbs the rounding remainder.
///
/// * `key` - random state token
/// * `x` - input data (n x d)
/// * `y` - output data (n x k)
/// * `splits` - fraction of rows per client, summing to one
///
/// # Returns `(key, [(x_c, y_c), ...])`
pub fn split_data_clients(
    key: RandomState,
    x: &Tensor,
    y: &Tensor,
    splits: &[f32],
) -> anyhow::Result<(RandomState, Vec<(Tensor, Tensor)>)> {
    let n = x.dim(0)?;
    if y.dim(0)? != n {
        anyhow::bail!("x has {} rows but y has {}", n, y.dim(0)?);
    }
    if splits.is_empty() || splits.iter().any(|&s| s <= 0.0) {
        anyhow::bail!("client splits must be positive: {:?}", splits);
    }
    let total: f32 = splits.iter().sum();
    if (total - 1.0).abs() > 1e-4 {
        anyhow::bail!("client splits must sum to one, got {}", total);
    }

    let (key, perm) = key.permutation(n);

    let mut sizes: Vec<usize> = splits
        .iter()
        .map(|&s| (s * n as f32).floor() as usize)
        .collect();
    let assigned: usize = sizes.iter().sum();
    if let Some(last) = sizes.last_mut() {
        *last += n - assigned;
    }
    if sizes.iter().any(|&s| s == 0) {
        anyhow::bail!("{} rows are too few for client splits {:?}", n, splits);
    }

    let mut out = Vec::with_capacity(sizes.len());
    let mut lb = 0;
    for sz in sizes {
        let idx: Vec<u32> = perm[lb..(lb + sz)].iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, sz, &Device::Cpu)?.to_device(x.device())?;
        out.push((x.index_select(&idx, 0)?, y.index_select(&idx, 0)?));
        lb += sz;
    }

    info!(
        "split {} rows into {} clients: {:?}",
        n,
        out.len(),
        out.iter().map(|(x, _)| x.dim(0).unwrap_or(0)).collect::<Vec<_>>()
    );

    Ok((key, out))
}

/// Equal fractional splits for `num_clients` clients
pub fn equal_splits(num_clients: usize) -> Vec<f32> {
    vec![1.0 / num_clients as f32; num_clients]
}
