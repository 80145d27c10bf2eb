use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuantError {
    #[error("invalid quantization configuration: {0}")]
    InvalidConfig(String),

    #[error("rounding variable is not bound to a weight shape yet")]
    Unbound,

    #[error("tensor shape {got:?} does not match bound shape {bound:?}")]
    ShapeMismatch { bound: Vec<usize>, got: Vec<usize> },

    #[error("quantization scale {0} is not usable")]
    DegenerateScale(f32),

    #[error("no layer named {0}")]
    UnknownLayer(String),
}

pub type Result<T> = std::result::Result<T, QuantError>;
