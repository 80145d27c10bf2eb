pub mod mnist;

pub use mnist::{DataLoader, MnistDataset};
