//! End-to-end quantization pipeline tests on synthetic data.

use adaround::data::mnist::MnistDataset;
use adaround::data::DataLoader;
use adaround::quantization::{
    clipped_sigmoid, equalize, grab_pairs, learn_adaround, AdaRoundConfig, AdaRoundFakeQuantize,
    Mlp, QuantConfig, QuantError, WeightQuantizer,
};
use adaround::{evaluate, Module, Tape, Tensor};

/// Deterministic synthetic "digits": class k lights up pixels k*78..k*78+78.
fn synthetic_loader(samples: usize, batch_size: usize) -> DataLoader {
    let mut images = vec![0.0f32; samples * 784];
    let mut labels = vec![0u8; samples];
    for i in 0..samples {
        let class = i % 10;
        labels[i] = class as u8;
        for p in 0..78 {
            images[i * 784 + class * 78 + p] = 1.0;
        }
    }
    let dataset = MnistDataset {
        images,
        labels,
        num_samples: samples,
    };
    DataLoader::new(dataset, batch_size, false)
}

fn trained_toy_model(loader: &mut DataLoader) -> Mlp {
    use adaround::loss::cross_entropy_loss;
    use adaround::optim::{Adam, Optimizer};

    let model = Mlp::new(&[784, 32, 10]);
    let mut opt = Adam::new(model.parameters(), 1e-2);

    for _ in 0..5 {
        loader.reset();
        while let Some((images, targets)) = loader.next_batch() {
            Tape::reset();
            opt.zero_grad();
            let logits = model.forward(&images);
            let loss = cross_entropy_loss(&logits, &targets);
            loss.backward();
            opt.step();
        }
    }
    model
}

#[test]
fn full_pipeline_preserves_most_accuracy() {
    let mut loader = synthetic_loader(200, 20);
    let model = trained_toy_model(&mut loader);

    let (float_top1, _) = evaluate(&model, &mut loader, 10);
    assert!(float_top1.avg > 90.0, "float model failed to learn the toy task");

    let mut quant = model.detached();
    quant.prepare(QuantConfig::int8(true)).unwrap();
    quant.calibrate(&mut loader, 10).unwrap();
    quant.convert().unwrap();

    let (quant_top1, _) = evaluate(&quant, &mut loader, 10);
    assert!(
        quant_top1.avg > float_top1.avg - 10.0,
        "int8 dropped accuracy from {} to {}",
        float_top1.avg,
        quant_top1.avg
    );
}

#[test]
fn detached_copy_isolates_quantization() {
    let mut loader = synthetic_loader(40, 20);
    let model = trained_toy_model(&mut loader);
    let w_before = model.layers[0].inner.weight.data().clone();

    let mut quant = model.detached();
    quant.prepare(QuantConfig::int8(true)).unwrap();
    quant.calibrate(&mut loader, 2).unwrap();
    quant.convert().unwrap();

    let w_after = model.layers[0].inner.weight.data().clone();
    assert_eq!(w_before, w_after, "quantizing the copy mutated the base model");
}

#[test]
fn learned_rounding_pipeline_runs_and_converts() {
    let mut loader = synthetic_loader(100, 20);
    let model = trained_toy_model(&mut loader);

    let mut learned = model.detached();
    let arcfg = AdaRoundConfig {
        total_epochs: 5,
        ..AdaRoundConfig::default()
    };
    learned
        .prepare_adaround(QuantConfig::int8(true), &arcfg)
        .unwrap();
    learned.calibrate(&mut loader, 5).unwrap();

    learn_adaround(&learned, &mut loader, "fc1", 5e-2, 5).unwrap();

    // Rounding decisions should have moved off the neutral 0.5
    let layer = learned.layer("fc1").unwrap();
    let Some(WeightQuantizer::AdaRound(aq)) = &layer.weight_quant else {
        panic!("fc1 lost its learned-rounding quantizer");
    };
    let h = aq.relaxation().unwrap();
    let hd = h.data();
    let moved = hd.iter().filter(|&&v| (v - 0.5).abs() > 0.02).count();
    assert!(moved > hd.len() / 2, "most decisions still undecided");

    learned.convert().unwrap();
    let (top1, _) = evaluate(&learned, &mut loader, 5);
    assert!(top1.avg > 50.0);
}

#[test]
fn learn_adaround_rejects_nearest_rounding_layers() {
    let mut loader = synthetic_loader(40, 20);
    let mut model = Mlp::new(&[784, 8, 10]);
    model.prepare(QuantConfig::int8(true)).unwrap();

    let err = learn_adaround(&model, &mut loader, "fc1", 1e-2, 1).unwrap_err();
    assert!(matches!(err, QuantError::InvalidConfig(_)));
}

#[test]
fn equalized_then_quantized_model_still_classifies() {
    let mut loader = synthetic_loader(100, 20);
    let model = trained_toy_model(&mut loader);
    let (base_top1, _) = evaluate(&model, &mut loader, 5);

    let mut eq = model.detached();
    let pairs = grab_pairs(&eq);
    equalize(&mut eq, &pairs, 1e-4).unwrap();
    eq.prepare(QuantConfig::int8(true)).unwrap();
    eq.calibrate(&mut loader, 5).unwrap();
    eq.convert().unwrap();

    let (eq_top1, _) = evaluate(&eq, &mut loader, 5);
    assert!(eq_top1.avg > base_top1.avg - 15.0);
}

#[test]
fn adaround_literal_rounding_case() {
    let aq = AdaRoundFakeQuantize::new(
        QuantConfig::int8(true),
        AdaRoundConfig {
            init_v: Some(Tensor::new(vec![0.0], &[1])),
            ..AdaRoundConfig::default()
        },
    )
    .unwrap();
    aq.base.set_quant_params(1.0, 0);

    let x = Tensor::new(vec![2.3], &[1]);
    let y = aq.adaround_rounding(&x).unwrap();
    assert!((y.data()[0] - 2.5).abs() < 1e-6);
}

#[test]
fn clipped_sigmoid_endpoints() {
    let v = Tensor::new(vec![-100.0, 0.0, 100.0], &[3]);
    let h = clipped_sigmoid(&v);
    let d = h.data();
    assert_eq!(d[0], 0.0);
    assert!((d[1] - 0.5).abs() < 1e-6);
    assert_eq!(d[2], 1.0);
}
