//! Post-training quantization toolkit: range observers, fake
//! quantizers with straight-through gradients, learned rounding, and
//! the accuracy-recovery passes (cross-layer equalization and bias
//! correction) that go with them.

pub mod adaround;
pub mod bias_correction;
pub mod config;
pub mod equalize;
pub mod error;
pub mod fake_quantize;
pub mod observers;
pub mod qlayers;

pub use adaround::{clipped_sigmoid, AdaRoundConfig, AdaRoundFakeQuantize};
pub use bias_correction::bias_correction;
pub use config::QuantConfig;
pub use equalize::{equalize, grab_pairs};
pub use error::{QuantError, Result};
pub use fake_quantize::{fake_quantize_per_tensor, FakeQuantize};
pub use observers::{MinMaxObserver, MovingAverageMinMaxObserver, Observer};
pub use qlayers::{learn_adaround, Mlp, QuantLinear, WeightQuantizer};
