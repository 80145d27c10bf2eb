use super::error::{QuantError, Result};

/// Integer grid for fake quantization. The default symmetric int8 grid
/// is [-128, 127] with zero point pinned at 0.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantConfig {
    pub bits: u8,
    pub symmetric: bool,
    pub quant_min: i32,
    pub quant_max: i32,
}

impl QuantConfig {
    pub fn int8(symmetric: bool) -> Self {
        QuantConfig {
            bits: 8,
            symmetric,
            quant_min: -128,
            quant_max: 127,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bits == 0 || self.bits > 32 {
            return Err(QuantError::InvalidConfig(format!(
                "unsupported bit width {}",
                self.bits
            )));
        }
        if self.quant_min >= self.quant_max {
            return Err(QuantError::InvalidConfig(format!(
                "empty quantization range [{}, {}]",
                self.quant_min, self.quant_max
            )));
        }
        Ok(())
    }

    /// Scale and zero point for an observed [min, max] range.
    pub fn quant_params(&self, min: f32, max: f32) -> (f32, i32) {
        let (min, max) = widen_degenerate(min, max);

        if self.symmetric {
            let max_abs = min.abs().max(max.abs());
            let scale = max_abs / self.quant_max as f32;
            (scale.max(f32::MIN_POSITIVE), 0)
        } else {
            let scale = (max - min) / (self.quant_max - self.quant_min) as f32;
            let scale = scale.max(f32::MIN_POSITIVE);
            let zp = self.quant_min as f32 - (min / scale).round();
            let zp = (zp as i32).clamp(self.quant_min, self.quant_max);
            (scale, zp)
        }
    }
}

impl Default for QuantConfig {
    fn default() -> Self {
        QuantConfig::int8(true)
    }
}

/// Collapsed observation ranges produce unusable scales; widen them to
/// a small non-empty interval around the observed value.
fn widen_degenerate(min: f32, max: f32) -> (f32, f32) {
    if min < max {
        return (min, max);
    }
    if min == 0.0 {
        (0.0, 1.0)
    } else if min > 0.0 {
        (0.9 * min, 1.1 * min)
    } else {
        (1.1 * min, 0.9 * min)
    }
}
