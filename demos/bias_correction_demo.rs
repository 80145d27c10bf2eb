//! Bias correction walkthrough: equalize, quantize under both int8
//! grids, then fold the quantization-induced output shift back into the
//! biases and measure the accuracy recovered.

use adaround::bootstrap::mnist_bootstrap;
use adaround::quantization::{bias_correction, equalize, grab_pairs, QuantConfig};
use adaround::evaluate;
use std::error::Error;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const NUM_EVAL_BATCHES: usize = 10;
const CALIBRATION_BATCHES: usize = 10;
const CORRECTION_BATCHES: usize = 10;

fn main() -> Result<(), Box<dyn Error>> {
    let mut results: Vec<String> = Vec::new();

    println!("Training float baseline on MNIST...");
    let (mut float_model, mut train_loader, mut test_loader) = mnist_bootstrap(2)?;

    let pairs = grab_pairs(&float_model);
    equalize(&mut float_model, &pairs, 1e-4)?;

    let (top1, _) = evaluate(&float_model, &mut test_loader, NUM_EVAL_BATCHES);
    println!("Float model (equalized): top1 {:.2}%", top1.avg);
    results.push(format!("float equalized: top1 {:.2}%", top1.avg));

    for symmetric in [true, false] {
        let grid = if symmetric { "symmetric" } else { "affine" };
        println!("\nQuantizing ({grid})...");

        let mut quant = float_model.detached();
        quant.prepare(QuantConfig::int8(symmetric))?;
        quant.calibrate(&mut train_loader, CALIBRATION_BATCHES)?;
        quant.convert()?;

        let (top1, _) = evaluate(&quant, &mut test_loader, NUM_EVAL_BATCHES);
        println!("{grid}, uncorrected: top1 {:.2}%", top1.avg);
        results.push(format!("{grid} uncorrected: top1 {:.2}%", top1.avg));

        bias_correction(&float_model, &mut quant, &mut train_loader, CORRECTION_BATCHES)?;

        let (top1, _) = evaluate(&quant, &mut test_loader, NUM_EVAL_BATCHES);
        println!("{grid}, bias corrected: top1 {:.2}%", top1.avg);
        results.push(format!("{grid} bias corrected: top1 {:.2}%", top1.avg));
    }

    println!("\nResults reiterated:");
    for line in &results {
        println!("  {line}");
    }

    Ok(())
}
