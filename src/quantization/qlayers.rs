use super::adaround::{AdaRoundConfig, AdaRoundFakeQuantize};
use super::config::QuantConfig;
use super::error::{QuantError, Result};
use super::fake_quantize::{fake_quantize_per_tensor, FakeQuantize};
use super::observers::Observer;
use crate::data::DataLoader;
use crate::nn::{Linear, Module};
use crate::optim::{Adam, Optimizer};
use crate::tape::Tape;
use crate::tensor::Tensor;

/// Which weight quantizer a prepared layer carries.
pub enum WeightQuantizer {
    Base(FakeQuantize),
    AdaRound(AdaRoundFakeQuantize),
}

impl Clone for WeightQuantizer {
    fn clone(&self) -> Self {
        match self {
            WeightQuantizer::Base(fq) => WeightQuantizer::Base(fq.clone()),
            WeightQuantizer::AdaRound(aq) => WeightQuantizer::AdaRound(aq.clone()),
        }
    }
}

/// Linear layer with optional weight and activation fake quantizers.
/// Unprepared it behaves exactly like its inner float layer.
pub struct QuantLinear {
    pub name: String,
    pub inner: Linear,
    pub weight_quant: Option<WeightQuantizer>,
    pub act_quant: Option<FakeQuantize>,
}

impl QuantLinear {
    pub fn new(name: &str, in_features: usize, out_features: usize) -> Self {
        QuantLinear {
            name: name.to_string(),
            inner: Linear::new(in_features, out_features),
            weight_quant: None,
            act_quant: None,
        }
    }

    /// Deep copy: fresh weight buffers and cloned quantizer state.
    pub fn detached(&self) -> QuantLinear {
        QuantLinear {
            name: self.name.clone(),
            inner: self.inner.detached(),
            weight_quant: self.weight_quant.clone(),
            act_quant: self.act_quant.clone(),
        }
    }

    /// Effective weight after the configured quantizer, or the float
    /// weight when none is attached.
    pub fn effective_weight(&self) -> Result<Tensor> {
        match &self.weight_quant {
            None => Ok(self.inner.weight.clone()),
            Some(WeightQuantizer::Base(fq)) => Ok(fq.forward(&self.inner.weight)),
            Some(WeightQuantizer::AdaRound(aq)) => aq.forward(&self.inner.weight),
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let w = self.effective_weight()?;
        let mut out = input.matmul(&w.transpose()).add_broadcast(&self.inner.bias);
        if let Some(aq) = &self.act_quant {
            out = aq.forward(&out);
        }
        Ok(out)
    }
}

/// Feed-forward network of named quantizable linear layers, ReLU
/// between all but the last.
pub struct Mlp {
    pub layers: Vec<QuantLinear>,
}

impl Mlp {
    /// `dims` lists layer widths, e.g. [784, 256, 128, 10]. Layers are
    /// named fc1, fc2, ... in order.
    pub fn new(dims: &[usize]) -> Self {
        assert!(dims.len() >= 2, "need at least input and output widths");
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, w)| QuantLinear::new(&format!("fc{}", i + 1), w[0], w[1]))
            .collect();
        Mlp { layers }
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn layer(&self, name: &str) -> Result<&QuantLinear> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| QuantError::UnknownLayer(name.to_string()))
    }

    fn layer_index(&self, name: &str) -> Result<usize> {
        self.layers
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| QuantError::UnknownLayer(name.to_string()))
    }

    /// Deep copy. Experiment variants go through this so quantizing one
    /// copy never disturbs another.
    pub fn detached(&self) -> Mlp {
        Mlp {
            layers: self.layers.iter().map(|l| l.detached()).collect(),
        }
    }

    /// Activations entering layer `idx`: the input run through every
    /// earlier layer (with its quantizers) and the interleaved ReLUs.
    pub fn forward_until(&self, idx: usize, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for layer in &self.layers[..idx] {
            x = layer.forward(&x)?.relu();
        }
        Ok(x)
    }

    fn forward_all(&self, input: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut x = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i < last {
                x = x.relu();
            }
        }
        Ok(x)
    }

    /// Attach nearest-rounding weight quantizers and moving-average
    /// activation quantizers to every layer.
    pub fn prepare(&mut self, qconfig: QuantConfig) -> Result<()> {
        qconfig.validate()?;
        for layer in &mut self.layers {
            layer.weight_quant = Some(WeightQuantizer::Base(FakeQuantize::new(
                qconfig,
                Observer::min_max_default(),
            )));
            layer.act_quant = Some(FakeQuantize::new(
                qconfig,
                Observer::moving_average_default(),
            ));
        }
        Ok(())
    }

    /// Like `prepare`, but weights get learned-rounding quantizers.
    pub fn prepare_adaround(&mut self, qconfig: QuantConfig, arcfg: &AdaRoundConfig) -> Result<()> {
        qconfig.validate()?;
        arcfg.validate()?;
        for layer in &mut self.layers {
            layer.weight_quant = Some(WeightQuantizer::AdaRound(AdaRoundFakeQuantize::new(
                qconfig,
                arcfg.clone(),
            )?));
            layer.act_quant = Some(FakeQuantize::new(
                qconfig,
                Observer::moving_average_default(),
            ));
        }
        Ok(())
    }

    /// Run calibration batches with observers on, then freeze the
    /// collected ranges.
    pub fn calibrate(&mut self, loader: &mut DataLoader, batches: usize) -> Result<()> {
        self.set_observers(true);
        loader.reset();
        let mut seen = 0;
        while let Some((images, _)) = loader.next_batch() {
            Tape::reset();
            self.forward_all(&images)?;
            seen += 1;
            if seen >= batches {
                break;
            }
        }
        self.set_observers(false);
        Ok(())
    }

    fn set_observers(&self, on: bool) {
        for layer in &self.layers {
            match &layer.weight_quant {
                Some(WeightQuantizer::Base(fq)) => fq.enable_observer(on),
                Some(WeightQuantizer::AdaRound(aq)) => aq.base.enable_observer(on),
                None => {}
            }
            if let Some(aq) = &layer.act_quant {
                aq.enable_observer(on);
            }
        }
    }

    /// Bake quantized weights into the float buffers and drop the
    /// weight quantizers. Learned roundings are hardened; nearest
    /// roundings are applied once. Activation quantizers stay attached
    /// with observers off.
    pub fn convert(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            let baked = match layer.weight_quant.take() {
                None => continue,
                Some(WeightQuantizer::Base(fq)) => {
                    fq.enable_observer(false);
                    let mut w = layer.inner.weight.detached();
                    w.requires_grad = false;
                    fq.forward(&w)
                }
                Some(WeightQuantizer::AdaRound(aq)) => {
                    aq.bind(layer.inner.weight.shape())?;
                    aq.freeze(&layer.inner.weight)?
                }
            };
            layer
                .inner
                .weight
                .data_mut()
                .copy_from_slice(&baked.data());
            if let Some(act) = &layer.act_quant {
                act.enable_observer(false);
            }
        }
        Ok(())
    }
}

impl Module for Mlp {
    fn forward(&self, input: &Tensor) -> Tensor {
        // Quantizer failures here mean the model was mis-prepared;
        // there is no sensible way to continue the forward pass.
        self.forward_all(input)
            .unwrap_or_else(|e| panic!("forward failed: {e}"))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers
            .iter()
            .flat_map(|l| l.inner.parameters())
            .collect()
    }
}

/// Optimize one layer's rounding variable against the float layer's
/// outputs. The rest of the model is untouched; earlier layers run as
/// configured to produce this layer's inputs.
pub fn learn_adaround(
    model: &Mlp,
    loader: &mut DataLoader,
    layer_name: &str,
    lr: f32,
    batches_per_epoch: usize,
) -> Result<()> {
    let idx = model.layer_index(layer_name)?;
    let layer = &model.layers[idx];

    let Some(WeightQuantizer::AdaRound(aq)) = &layer.weight_quant else {
        return Err(QuantError::InvalidConfig(format!(
            "layer {layer_name} has no learned-rounding quantizer"
        )));
    };
    aq.bind(layer.inner.weight.shape())?;
    aq.base.enable_observer(false);

    // Float reference weights, cut out of the graph
    let mut w_float = layer.inner.weight.detached();
    w_float.requires_grad = false;
    let w_float_t = w_float.transpose();

    let mut opt = Adam::new(vec![aq.rounding_variable()?], lr);
    let total_epochs = aq.cfg.total_epochs;

    for count in 0..total_epochs {
        loader.reset();
        let mut seen = 0;
        let mut last_loss = 0.0;

        while let Some((images, _)) = loader.next_batch() {
            Tape::reset();
            opt.zero_grad();

            let x = model.forward_until(idx, &images)?;

            let float_out = x.matmul(&w_float_t).add_broadcast(&layer.inner.bias);

            let rounded = aq.adaround_rounding(&layer.inner.weight)?;
            let q_w = fake_quantize_per_tensor(
                &rounded,
                aq.base.scale(),
                aq.base.zero_point(),
                aq.base.config.quant_min,
                aq.base.config.quant_max,
            );
            let q_out = x.matmul(&q_w.transpose()).add_broadcast(&layer.inner.bias);

            let recon = (&float_out - &q_out).frobenius_norm();
            let loss = aq.layer_loss_function(count, &recon, true)?;
            loss.backward();
            opt.step();

            last_loss = loss.data()[0];
            seen += 1;
            if seen >= batches_per_epoch {
                break;
            }
        }

        println!(
            "{layer_name}: epoch {}/{} loss {:.6}",
            count + 1,
            total_epochs,
            last_loss
        );
    }

    Ok(())
}
