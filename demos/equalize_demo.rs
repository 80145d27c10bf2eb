//! Cross-layer equalization grid: quantize with and without
//! equalization, under symmetric and affine int8 grids, and compare.

use adaround::bootstrap::mnist_bootstrap;
use adaround::quantization::{equalize, grab_pairs, QuantConfig};
use adaround::evaluate;
use std::error::Error;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const NUM_EVAL_BATCHES: usize = 10;
const CALIBRATION_BATCHES: usize = 10;
const EQUALIZE_THRESHOLD: f32 = 1e-4;

fn main() -> Result<(), Box<dyn Error>> {
    let mut results: Vec<String> = Vec::new();

    println!("Training float baseline on MNIST...");
    let (float_model, mut train_loader, mut test_loader) = mnist_bootstrap(2)?;

    let (top1, _) = evaluate(&float_model, &mut test_loader, NUM_EVAL_BATCHES);
    println!("Float model: top1 {:.2}%", top1.avg);
    results.push(format!("float: top1 {:.2}%", top1.avg));

    for symmetric in [true, false] {
        for with_equalize in [false, true] {
            let grid = if symmetric { "symmetric" } else { "affine" };
            let eq = if with_equalize { "equalized" } else { "plain" };
            println!("\nQuantizing ({grid}, {eq})...");

            let mut model = float_model.detached();
            if with_equalize {
                let pairs = grab_pairs(&model);
                equalize(&mut model, &pairs, EQUALIZE_THRESHOLD)?;
            }
            model.prepare(QuantConfig::int8(symmetric))?;
            model.calibrate(&mut train_loader, CALIBRATION_BATCHES)?;
            model.convert()?;

            let (top1, _) = evaluate(&model, &mut test_loader, NUM_EVAL_BATCHES);
            println!("{grid}/{eq}: top1 {:.2}%", top1.avg);
            results.push(format!("{grid}/{eq}: top1 {:.2}%", top1.avg));
        }
    }

    println!("\nResults reiterated:");
    for line in &results {
        println!("  {line}");
    }

    Ok(())
}
