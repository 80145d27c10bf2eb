//! Shared demo setup: download MNIST, train a small float MLP, and hand
//! back the model with train and test loaders.

use crate::data::{DataLoader, MnistDataset};
use crate::loss::cross_entropy_loss;
use crate::nn::Module;
use crate::optim::{Adam, Optimizer, StepLR};
use crate::quantization::Mlp;
use crate::tape::Tape;
use indicatif::{ProgressBar, ProgressStyle};
use std::error::Error;

const DATA_DIR: &str = "data/mnist";
const TRAIN_BATCH_SIZE: usize = 64;
const EVAL_BATCH_SIZE: usize = 30;

/// Train a [784, 256, 128, 10] float model for `train_epochs` epochs
/// and return it with shuffled train and unshuffled test loaders.
pub fn mnist_bootstrap(
    train_epochs: u32,
) -> Result<(Mlp, DataLoader, DataLoader), Box<dyn Error>> {
    let train_set = MnistDataset::load(DATA_DIR, true)?;
    let test_set = MnistDataset::load(DATA_DIR, false)?;

    let mut train_loader = DataLoader::new(train_set, TRAIN_BATCH_SIZE, true);
    let test_loader = DataLoader::new(test_set, EVAL_BATCH_SIZE, false);

    let model = Mlp::new(&[784, 256, 128, 10]);
    let mut opt = Adam::new(model.parameters(), 1e-3);
    let mut scheduler = StepLR::new(1e-3, 2, 0.5);

    for epoch in 1..=train_epochs {
        train_loader.reset();
        let batches = train_loader.num_batches() as u64;
        let bar = ProgressBar::new(batches);
        bar.set_style(
            ProgressStyle::with_template(
                "epoch {msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("=>-"),
        );
        bar.set_message(format!("{epoch}/{train_epochs}"));

        let mut running_loss = 0.0;
        let mut steps = 0u64;
        while let Some((images, labels)) = train_loader.next_batch() {
            Tape::reset();
            opt.zero_grad();

            let logits = model.forward(&images);
            let loss = cross_entropy_loss(&logits, &labels);
            loss.backward();
            opt.step();

            running_loss += loss.data()[0];
            steps += 1;
            bar.inc(1);
        }
        bar.finish_with_message(format!(
            "{epoch}/{train_epochs} avg loss {:.4}",
            running_loss / steps.max(1) as f32
        ));
        scheduler.step(&mut opt);
    }

    Ok((model, train_loader, test_loader))
}
