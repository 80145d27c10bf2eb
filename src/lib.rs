//! Post-training quantization experiments on a small tape-based
//! autograd stack. The crate provides the tensor and training
//! machinery, int8 fake quantization with learned (AdaRound-style)
//! weight rounding, and the cross-layer equalization and bias
//! correction passes used by the demos.

pub mod bootstrap;
pub mod data;
pub mod eval;
pub mod gemm;
pub mod loss;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod quantization;
pub mod tape;
pub mod tensor;

pub use eval::{evaluate, AverageMeter};
pub use nn::{Linear, Module};
pub use tape::Tape;
pub use tensor::Tensor;
