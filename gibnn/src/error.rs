use thiserror::Error;

/// Failures of the inference core.
///
/// Library functions return `anyhow::Result`; recover the kind with
/// `err.downcast_ref::<PviError>()`. Nothing here is retried.
#[derive(Debug, Clone, Error)]
pub enum PviError {
    /// Unsupported model/variant pairing, mismatched dimensions, bad
    /// client indexes; raised before training starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A factor whose precision is not positive definite reached the
    /// sampling step.
    #[error("invalid factor: non-positive pivot {pivot} at column {column}")]
    InvalidFactor { column: usize, pivot: f64 },

    /// The freezing protocol was asked about a client it never saw.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// KL or log-likelihood evaluated to a non-finite value.
    #[error("numeric instability: {0}")]
    NumericInstability(String),
}

pub fn configuration<S: Into<String>>(msg: S) -> anyhow::Error {
    PviError::Configuration(msg.into()).into()
}

/// Check that every element of a scalar-valued quantity is finite
pub fn ensure_finite(name: &str, values: &candle_core::Tensor) -> anyhow::Result<()> {
    let values: Vec<f32> = values
        .detach()
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1()?;
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(PviError::NumericInstability(format!("{} is not finite: {:?}", name, values)).into())
    }
}
