use super::error::Result;
use super::qlayers::Mlp;
use crate::data::DataLoader;
use crate::tape::Tape;

/// Quantization shifts each output channel's mean response; fold the
/// observed shift back into the quantized model's biases.
///
/// Layers are corrected front to back so each correction sees the
/// already-corrected earlier layers. For every layer, the per-channel
/// mean of the float model's pre-activation outputs is compared against
/// the quantized model's, and the difference is added to the quantized
/// bias.
pub fn bias_correction(
    float_model: &Mlp,
    quant_model: &mut Mlp,
    loader: &mut DataLoader,
    neval_batches: usize,
) -> Result<()> {
    let num_layers = quant_model.layers.len();

    for idx in 0..num_layers {
        let channels = quant_model.layers[idx].inner.out_features;
        let mut float_mean = vec![0.0f64; channels];
        let mut quant_mean = vec![0.0f64; channels];
        let mut rows_seen = 0usize;

        loader.reset();
        let mut batches = 0;
        while let Some((images, _)) = loader.next_batch() {
            Tape::reset();

            // Each model feeds the layer with its own activations
            let xf = float_model.forward_until(idx, &images)?;
            let float_out = float_model.layers[idx].forward(&xf)?;

            let xq = quant_model.forward_until(idx, &images)?;
            let quant_out = quant_model.layers[idx].forward(&xq)?;

            let rows = images.shape()[0];
            accumulate_channel_sums(&float_out.data(), rows, channels, &mut float_mean);
            accumulate_channel_sums(&quant_out.data(), rows, channels, &mut quant_mean);
            rows_seen += rows;

            batches += 1;
            if batches >= neval_batches {
                break;
            }
        }

        if rows_seen == 0 {
            continue;
        }

        let mut bias = quant_model.layers[idx].inner.bias.data_mut();
        for c in 0..channels {
            let shift = (float_mean[c] - quant_mean[c]) / rows_seen as f64;
            bias[c] += shift as f32;
        }
    }

    Ok(())
}

fn accumulate_channel_sums(data: &[f32], rows: usize, channels: usize, sums: &mut [f64]) {
    for r in 0..rows {
        for c in 0..channels {
            sums[c] += data[r * channels + c] as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::mnist::MnistDataset;
    use crate::quantization::config::QuantConfig;
    use crate::tensor::Tensor;

    fn constant_loader(n: usize, value: f32) -> DataLoader {
        let dataset = MnistDataset {
            images: vec![value; n * 784],
            labels: vec![0; n],
            num_samples: n,
        };
        DataLoader::new(dataset, n, false)
    }

    #[test]
    fn correction_restores_mean_output() {
        let float_model = Mlp::new(&[784, 8, 4]);
        let mut quant_model = float_model.detached();
        quant_model.prepare(QuantConfig::int8(true)).unwrap();

        let mut loader = constant_loader(4, 0.5);
        quant_model.calibrate(&mut loader, 1).unwrap();
        quant_model.convert().unwrap();
        // Isolate the weight-quantization shift
        for layer in &mut quant_model.layers {
            layer.act_quant = None;
        }

        bias_correction(&float_model, &mut quant_model, &mut loader, 1).unwrap();

        // After correction the per-channel means of the final layer must
        // agree on the calibration data.
        let x = Tensor::full(&[4, 784], 0.5);
        Tape::reset();
        let idx = 1;
        let xf = float_model.forward_until(idx, &x).unwrap();
        let fo = float_model.layers[idx].forward(&xf).unwrap();
        let xq = quant_model.forward_until(idx, &x).unwrap();
        let qo = quant_model.layers[idx].forward(&xq).unwrap();

        let channels = 4;
        let mut fmean = vec![0.0f64; channels];
        let mut qmean = vec![0.0f64; channels];
        accumulate_channel_sums(&fo.data(), 4, channels, &mut fmean);
        accumulate_channel_sums(&qo.data(), 4, channels, &mut qmean);
        for c in 0..channels {
            assert!(((fmean[c] - qmean[c]) / 4.0).abs() < 1e-3);
        }
    }
}
