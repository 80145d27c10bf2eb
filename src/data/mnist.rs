use crate::tensor::Tensor;
use flate2::read::GzDecoder;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::error::Error;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

const IMAGE_MAGIC: u32 = 0x803;
const LABEL_MAGIC: u32 = 0x801;

const MIRRORS: &[&str] = &[
    "https://ossci-datasets.s3.amazonaws.com/mnist",
    "https://storage.googleapis.com/cvdf-datasets/mnist",
];

const FILES: &[(&str, &str)] = &[
    ("train-images-idx3-ubyte.gz", "train_images"),
    ("train-labels-idx1-ubyte.gz", "train_labels"),
    ("t10k-images-idx3-ubyte.gz", "test_images"),
    ("t10k-labels-idx1-ubyte.gz", "test_labels"),
];

/// MNIST images as normalized f32 rows of length 784, labels as class
/// indices.
pub struct MnistDataset {
    pub images: Vec<f32>,
    pub labels: Vec<u8>,
    pub num_samples: usize,
}

impl MnistDataset {
    /// Load the train or test split from `dir`, downloading the gzipped
    /// IDX files on first use.
    pub fn load(dir: &str, train: bool) -> Result<Self, Box<dyn Error>> {
        fs::create_dir_all(dir)?;

        let prefix = if train { "train" } else { "t10k" };
        let images_gz = format!("{}-images-idx3-ubyte.gz", prefix);
        let labels_gz = format!("{}-labels-idx1-ubyte.gz", prefix);

        let images_path = ensure_file(dir, &images_gz)?;
        let labels_path = ensure_file(dir, &labels_gz)?;

        let images = parse_images(&images_path)?;
        let labels = parse_labels(&labels_path)?;

        let num_samples = labels.len();
        if images.len() != num_samples * 784 {
            return Err(format!(
                "image/label count mismatch: {} pixels for {} labels",
                images.len(),
                num_samples
            )
            .into());
        }

        Ok(MnistDataset {
            images,
            labels,
            num_samples,
        })
    }
}

fn ensure_file(dir: &str, name: &str) -> Result<PathBuf, Box<dyn Error>> {
    let path = Path::new(dir).join(name);
    if path.exists() {
        return Ok(path);
    }

    let mut last_err: Option<Box<dyn Error>> = None;
    for mirror in MIRRORS {
        let url = format!("{}/{}", mirror, name);
        println!("Downloading {}", url);
        match download(&url) {
            Ok(bytes) => {
                fs::write(&path, bytes)?;
                return Ok(path);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| format!("no mirror could serve {}", name).into()))
}

fn download(url: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let resp = reqwest::blocking::get(url)?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {} for {}", resp.status(), url).into());
    }
    Ok(resp.bytes()?.to_vec())
}

fn read_gz(path: &Path) -> Result<Vec<u8>, Box<dyn Error>> {
    let raw = fs::read(path)?;
    let mut decoder = GzDecoder::new(&raw[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn read_u32_be(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn parse_images(path: &Path) -> Result<Vec<f32>, Box<dyn Error>> {
    let bytes = read_gz(path)?;
    let magic = read_u32_be(&bytes, 0);
    if magic != IMAGE_MAGIC {
        return Err(format!("bad image magic: {:#x}", magic).into());
    }
    let count = read_u32_be(&bytes, 4) as usize;
    let rows = read_u32_be(&bytes, 8) as usize;
    let cols = read_u32_be(&bytes, 12) as usize;
    let pixels = &bytes[16..];
    if pixels.len() != count * rows * cols {
        return Err("truncated image file".into());
    }

    // Normalize to [0, 1] in parallel
    let mut images = vec![0.0f32; pixels.len()];
    images
        .par_chunks_mut(rows * cols)
        .zip(pixels.par_chunks(rows * cols))
        .for_each(|(dst, src)| {
            for (d, &s) in dst.iter_mut().zip(src.iter()) {
                *d = s as f32 / 255.0;
            }
        });

    Ok(images)
}

fn parse_labels(path: &Path) -> Result<Vec<u8>, Box<dyn Error>> {
    let bytes = read_gz(path)?;
    let magic = read_u32_be(&bytes, 0);
    if magic != LABEL_MAGIC {
        return Err(format!("bad label magic: {:#x}", magic).into());
    }
    let count = read_u32_be(&bytes, 4) as usize;
    let labels = bytes[8..].to_vec();
    if labels.len() != count {
        return Err("truncated label file".into());
    }
    Ok(labels)
}

/// Mini-batch iterator over an owned dataset. `reset` reshuffles when
/// shuffling is on, so repeated evaluation passes see the same data in
/// a fresh order.
pub struct DataLoader {
    dataset: MnistDataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<usize>,
    pos: usize,
}

impl DataLoader {
    pub fn new(dataset: MnistDataset, batch_size: usize, shuffle: bool) -> Self {
        let indices: Vec<usize> = (0..dataset.num_samples).collect();
        let mut loader = DataLoader {
            dataset,
            batch_size,
            shuffle,
            indices,
            pos: 0,
        };
        loader.reset();
        loader
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        if self.shuffle {
            self.indices.shuffle(&mut rand::thread_rng());
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.num_samples / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Next (images [batch, 784], labels [batch]) pair, or None at the
    /// end of the epoch. Partial trailing batches are dropped.
    pub fn next_batch(&mut self) -> Option<(Tensor, Tensor)> {
        if self.pos + self.batch_size > self.dataset.num_samples {
            return None;
        }
        let idx = &self.indices[self.pos..self.pos + self.batch_size];
        self.pos += self.batch_size;

        let mut images = vec![0.0f32; self.batch_size * 784];
        images
            .par_chunks_mut(784)
            .enumerate()
            .for_each(|(row, dst)| {
                let src = idx[row] * 784;
                dst.copy_from_slice(&self.dataset.images[src..src + 784]);
            });

        let labels: Vec<f32> = idx.iter().map(|&i| self.dataset.labels[i] as f32).collect();

        Some((
            Tensor::new(images, &[self.batch_size, 784]),
            Tensor::new(labels, &[self.batch_size]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_dataset(n: usize) -> MnistDataset {
        let images: Vec<f32> = (0..n * 784).map(|i| (i % 255) as f32 / 255.0).collect();
        let labels: Vec<u8> = (0..n).map(|i| (i % 10) as u8).collect();
        MnistDataset {
            images,
            labels,
            num_samples: n,
        }
    }

    #[test]
    fn loader_yields_full_batches_only() {
        let mut loader = DataLoader::new(tiny_dataset(10), 3, false);
        let mut count = 0;
        while let Some((x, y)) = loader.next_batch() {
            assert_eq!(x.shape(), &[3, 784]);
            assert_eq!(y.shape(), &[3]);
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn reset_restarts_iteration() {
        let mut loader = DataLoader::new(tiny_dataset(6), 2, false);
        while loader.next_batch().is_some() {}
        assert!(loader.next_batch().is_none());
        loader.reset();
        assert!(loader.next_batch().is_some());
    }

    #[test]
    fn unshuffled_loader_preserves_order() {
        let mut loader = DataLoader::new(tiny_dataset(4), 2, false);
        let (_, y) = loader.next_batch().unwrap();
        assert_eq!(y.data().as_slice(), &[0.0, 1.0]);
    }
}
