use std::io;

use thiserror::Error;

use crate::Tick;

/// Every failure the simulation engine can surface.
#[derive(Error, Debug)]
pub enum KsetError {
    /// Invalid construction parameters.
    #[error("config error: {0}")]
    Config(String),

    /// A stimulus vector does not match the layer it is applied to.
    #[error("stimulus length mismatch: layer has {expected} sets, got {got} values")]
    StimulusLength { expected: usize, got: usize },

    /// A weight or stimulus value was NaN or infinite.
    #[error("non-finite value in {what}")]
    NonFinite { what: String },

    /// A unit's ODE state overflowed during integration.
    #[error("numeric instability in layer {layer}, set {index} at tick {tick}")]
    NumericInstability { layer: usize, index: usize, tick: Tick },

    /// A delayed read reached past the retention window.
    #[error("tick {tick} is no longer retained (oldest retained tick is {oldest})")]
    HistoryExhausted { tick: Tick, oldest: Tick },

    /// A read asked for a tick that has not been committed yet.
    #[error("tick {tick} has not been computed (latest committed tick: {latest:?})")]
    NotYetComputed { tick: Tick, latest: Option<Tick> },

    /// `advance` was called for a tick other than the next one.
    #[error("advance out of order: expected tick {expected}, got {got}")]
    TickOutOfOrder { expected: Tick, got: Tick },

    /// A training rule wrote weights outside its declared bounds.
    #[error("training error: {0}")]
    Training(String),

    /// The worker pool could not be built.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A network image is malformed or inconsistent.
    #[error("invalid network image: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, KsetError>;

/// Fail with [`KsetError::NonFinite`] unless `value` is finite.
pub(crate) fn ensure_finite(value: f64, what: impl FnOnce() -> String) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(KsetError::NonFinite { what: what() })
    }
}
