use candle_core::{Device, Tensor};

///
/// Indexes of the `iter`-th cyclic minibatch
///
/// The window starts at `iter * batch_size` and wraps around the
/// partition, so the result only depends on the iteration index.
///
/// * `n` - partition size
/// * `batch_size` - number of rows per minibatch
/// * `iter` - local iteration index
///
pub fn minibatch_indices(n: usize, batch_size: usize, iter: usize) -> Vec<u32> {
    if n == 0 {
        return vec![];
    }
    let start = (iter % n) * (batch_size % n) % n;
    (0..batch_size)
        .map(|j| ((start + j) % n) as u32)
        .collect()
}

///
/// Take the `iter`-th cyclic minibatch of a partition
///
/// * `x` - input data (n x d)
/// * `y` - output data (n x k)
/// * `batch_size` - number of rows per minibatch
/// * `iter` - local iteration index
///
/// # Returns `(x_mb, y_mb)`
pub fn take_minibatch(
    x: &Tensor,
    y: &Tensor,
    batch_size: usize,
    iter: usize,
) -> anyhow::Result<(Tensor, Tensor)> {
    let n = x.dim(0)?;
    if y.dim(0)? != n {
        anyhow::bail!("x has {} rows but y has {}", n, y.dim(0)?);
    }
    let indices = minibatch_indices(n, batch_size, iter);
    let indices = Tensor::from_vec(indices, batch_size, &Device::Cpu)?.to_device(x.device())?;
    Ok((x.index_select(&indices, 0)?, y.index_select(&indices, 0)?))
}
