//! Batched dense linear algebra on candle tensors.
//!
//! Everything is written with differentiable tensor primitives
//! (`narrow`, `cat`, `matmul`, elementwise ops), so gradients flow
//! through the Cholesky factor and triangular solves back into the
//! natural parameters that produced them.

use crate::error::{configuration, PviError};
use candle_core::{DType, Tensor, D};

/// Split `[.., d, d2]` into (original dims, number of batch elements)
fn batch_dims(a: &Tensor) -> anyhow::Result<(Vec<usize>, usize)> {
    let dims = a.dims().to_vec();
    if dims.len() < 2 {
        return Err(configuration(format!("expected a batch of matrices, got {:?}", dims)));
    }
    let nb = dims[..dims.len() - 2].iter().product();
    Ok((dims, nb))
}

///
/// Report the first column whose pivot is not strictly positive
///
/// * `pivots` - one (nb x 1 x 1) pivot per column, in column order
///
fn check_pivots(pivots: &[Tensor]) -> anyhow::Result<()> {
    let d = pivots.len();
    if d == 0 {
        return Ok(());
    }
    // nb x 1 x d, so the column is the flat index modulo d
    let values: Vec<f64> = Tensor::cat(pivots, 2)?
        .detach()
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1()?;
    let first_bad = values
        .iter()
        .enumerate()
        .filter(|(_, v)| !(v.is_finite() && **v > 0.0))
        .map(|(i, &v)| (i % d, v))
        .min_by_key(|&(column, _)| column);
    match first_bad {
        Some((column, pivot)) => Err(PviError::InvalidFactor { column, pivot }.into()),
        None => Ok(()),
    }
}

///
/// Lower Cholesky factor `L` with `A = L Lᵀ` for a batch of symmetric
/// positive definite matrices
///
/// Right-looking: each new column is read off the trailing matrix,
/// which is then downdated by the column's outer product. Pivots are
/// checked once, after the last column.
///
/// * `a` - matrices (.. x d x d)
///
/// Fails with `PviError::InvalidFactor` naming the first column with a
/// pivot that is not strictly positive.
///
pub fn cholesky(a: &Tensor) -> anyhow::Result<Tensor> {
    let (dims, nb) = batch_dims(a)?;
    let d = dims[dims.len() - 1];
    if dims[dims.len() - 2] != d {
        return Err(configuration(format!("cholesky needs square matrices, got {:?}", dims)));
    }
    let device = a.device();
    let mut trailing = a.reshape((nb, d, d))?;

    let mut cols: Vec<Tensor> = Vec::with_capacity(d);
    let mut pivots: Vec<Tensor> = Vec::with_capacity(d);
    for j in 0..d {
        let v = trailing.narrow(2, j, 1)?.contiguous()?; // nb x d x 1
        let pivot = v.narrow(1, j, 1)?;

        let lower: Vec<f32> = (0..d).map(|i| if i >= j { 1. } else { 0. }).collect();
        let lower = Tensor::from_vec(lower, (1, d, 1), device)?.to_dtype(a.dtype())?;
        let l_j = v.broadcast_div(&pivot.sqrt()?)?.broadcast_mul(&lower)?;

        if j + 1 < d {
            trailing = (trailing - l_j.matmul(&l_j.transpose(1, 2)?.contiguous()?)?)?;
        }
        pivots.push(pivot);
        cols.push(l_j);
    }
    check_pivots(&pivots)?;
    Ok(Tensor::cat(&cols, 2)?.reshape(dims)?)
}

///
/// Solve `L X = B` by forward substitution
///
/// * `l` - lower triangular matrices (.. x d x d)
/// * `b` - right-hand sides (.. x d x k), same batch dims as `l`
///
pub fn tril_solve(l: &Tensor, b: &Tensor) -> anyhow::Result<Tensor> {
    let (l_dims, nb) = batch_dims(l)?;
    let (b_dims, nb_b) = batch_dims(b)?;
    let d = l_dims[l_dims.len() - 1];
    let k = b_dims[b_dims.len() - 1];
    if nb != nb_b || b_dims[b_dims.len() - 2] != d {
        return Err(configuration(format!(
            "tril_solve shape mismatch: {:?} vs {:?}",
            l_dims, b_dims
        )));
    }
    let l = l.reshape((nb, d, d))?;
    let mut residual = b.reshape((nb, d, k))?;

    let mut rows: Vec<Tensor> = Vec::with_capacity(d);
    for i in 0..d {
        let l_ii = l.narrow(1, i, 1)?.narrow(2, i, 1)?;
        let x_i = residual.narrow(1, i, 1)?.broadcast_div(&l_ii)?; // nb x 1 x k
        if i + 1 < d {
            let l_col = l.narrow(2, i, 1)?.contiguous()?; // nb x d x 1
            residual = (residual - l_col.matmul(&x_i.contiguous()?)?)?;
        }
        rows.push(x_i);
    }
    Ok(Tensor::cat(&rows, 1)?.reshape(b_dims)?)
}

/// `L⁻¹` for a batch of lower triangular matrices
pub fn tril_inverse(l: &Tensor) -> anyhow::Result<Tensor> {
    let d = l.dim(D::Minus1)?;
    let eye = Tensor::eye(d, l.dtype(), l.device())?
        .broadcast_as(l.shape())?
        .contiguous()?;
    tril_solve(l, &eye)
}

/// Diagonal entries (.. x d) of a batch of matrices (.. x d x d)
pub fn diagonal(a: &Tensor) -> candle_core::Result<Tensor> {
    let d = a.dim(D::Minus1)?;
    let eye = Tensor::eye(d, a.dtype(), a.device())?;
    a.broadcast_mul(&eye)?.sum(D::Minus1)
}

/// `log det A` given the Cholesky factor `L` of `A`
pub fn logdet_from_cholesky(l: &Tensor) -> candle_core::Result<Tensor> {
    diagonal(l)?.log()?.sum(D::Minus1)? * 2.0
}

/// Swap the last two axes
pub fn transpose_last(a: &Tensor) -> candle_core::Result<Tensor> {
    let r = a.rank();
    a.transpose(r - 2, r - 1)?.contiguous()
}
