//! Learned-rounding quantization walkthrough: train a float MLP, take
//! an int8 post-training baseline with nearest rounding, then optimize
//! the rounding of the first three layers and compare accuracy.

use adaround::bootstrap::mnist_bootstrap;
use adaround::quantization::{learn_adaround, AdaRoundConfig, QuantConfig};
use adaround::evaluate;
use std::error::Error;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const NUM_EVAL_BATCHES: usize = 10;
const CALIBRATION_BATCHES: usize = 10;

fn main() -> Result<(), Box<dyn Error>> {
    let mut results: Vec<String> = Vec::new();

    println!("Training float baseline on MNIST...");
    let (float_model, mut train_loader, mut test_loader) = mnist_bootstrap(2)?;

    let (top1, top5) = evaluate(&float_model, &mut test_loader, NUM_EVAL_BATCHES);
    println!("Float model: top1 {:.2}% top5 {:.2}%", top1.avg, top5.avg);
    results.push(format!("float: top1 {:.2}%", top1.avg));

    // Nearest-rounding int8 baseline
    println!("\nQuantizing with nearest rounding...");
    let mut nearest = float_model.detached();
    nearest.prepare(QuantConfig::int8(true))?;
    nearest.calibrate(&mut train_loader, CALIBRATION_BATCHES)?;
    nearest.convert()?;

    let (top1, _) = evaluate(&nearest, &mut test_loader, NUM_EVAL_BATCHES);
    println!("Nearest rounding: top1 {:.2}%", top1.avg);
    results.push(format!("nearest rounding: top1 {:.2}%", top1.avg));

    // Learned rounding on the first three layers
    println!("\nQuantizing with learned rounding...");
    let mut learned = float_model.detached();
    learned.prepare_adaround(QuantConfig::int8(true), &AdaRoundConfig::default())?;
    learned.calibrate(&mut train_loader, CALIBRATION_BATCHES)?;

    let layer_names: Vec<String> = learned
        .layer_names()
        .iter()
        .take(3)
        .map(|s| s.to_string())
        .collect();

    for name in &layer_names {
        println!("\nOptimizing rounding for {name}...");
        learn_adaround(&learned, &mut train_loader, name, 1e-2, 20)?;

        let (top1, _) = evaluate(&learned, &mut test_loader, NUM_EVAL_BATCHES);
        println!("After {name}: top1 {:.2}%", top1.avg);
        results.push(format!("learned rounding through {name}: top1 {:.2}%", top1.avg));
    }

    learned.convert()?;
    let (top1, _) = evaluate(&learned, &mut test_loader, NUM_EVAL_BATCHES);
    println!("\nConverted learned-rounding model: top1 {:.2}%", top1.avg);
    results.push(format!("learned rounding converted: top1 {:.2}%", top1.avg));

    println!("\nResults reiterated:");
    for line in &results {
        println!("  {line}");
    }

    Ok(())
}
