use super::error::Result;
use super::qlayers::Mlp;

/// Names of consecutive linear layer pairs, the unit cross-layer
/// equalization operates on.
pub fn grab_pairs(model: &Mlp) -> Vec<(String, String)> {
    model
        .layers
        .windows(2)
        .map(|w| (w[0].name.clone(), w[1].name.clone()))
        .collect()
}

/// Cross-layer range equalization. For each adjacent pair, per channel
/// i: s_i = sqrt(r2_i / r1_i) where r1_i is the max |W1[i, :]| and r2_i
/// the max |W2[:, i]|. Scaling W1's rows and bias by s and W2's columns
/// by 1/s leaves the composed function unchanged (ReLU is positively
/// homogeneous) while balancing the two weight ranges. Pairs are swept
/// repeatedly until no scale moves further than `threshold` from 1.
pub fn equalize(model: &mut Mlp, pairs: &[(String, String)], threshold: f32) -> Result<()> {
    const MAX_SWEEPS: usize = 100;

    for _ in 0..MAX_SWEEPS {
        let mut max_delta = 0.0f32;

        for (first, second) in pairs {
            let channels = model.layer(first)?.inner.out_features;
            let delta = equalize_pair(model, first, second, channels)?;
            max_delta = max_delta.max(delta);
        }

        if max_delta < threshold {
            break;
        }
    }

    Ok(())
}

fn equalize_pair(model: &mut Mlp, first: &str, second: &str, channels: usize) -> Result<f32> {
    // Per-channel ranges of both weights
    let (r1, r2) = {
        let l1 = model.layer(first)?;
        let l2 = model.layer(second)?;
        debug_assert_eq!(l2.inner.in_features, channels);

        let w1 = l1.inner.weight.data();
        let w2 = l2.inner.weight.data();
        let in1 = l1.inner.in_features;
        let out2 = l2.inner.out_features;
        let in2 = l2.inner.in_features;

        let mut r1 = vec![0.0f32; channels];
        let mut r2 = vec![0.0f32; channels];
        for i in 0..channels {
            for j in 0..in1 {
                r1[i] = r1[i].max(w1[i * in1 + j].abs());
            }
            for o in 0..out2 {
                r2[i] = r2[i].max(w2[o * in2 + i].abs());
            }
        }
        (r1, r2)
    };

    let scales: Vec<f32> = r1
        .iter()
        .zip(r2.iter())
        .map(|(&a, &b)| {
            if a > 0.0 && b > 0.0 {
                (b / a).sqrt()
            } else {
                1.0
            }
        })
        .collect();

    // Apply: W1 rows and b1 scale by s, W2 columns by 1/s
    {
        let l1 = model.layer(first)?;
        let in1 = l1.inner.in_features;
        let mut w1 = l1.inner.weight.data_mut();
        let mut b1 = l1.inner.bias.data_mut();
        for i in 0..channels {
            for j in 0..in1 {
                w1[i * in1 + j] *= scales[i];
            }
            b1[i] *= scales[i];
        }
    }
    {
        let l2 = model.layer(second)?;
        let in2 = l2.inner.in_features;
        let out2 = l2.inner.out_features;
        let mut w2 = l2.inner.weight.data_mut();
        for o in 0..out2 {
            for i in 0..channels {
                w2[o * in2 + i] /= scales[i];
            }
        }
    }

    let max_delta = scales
        .iter()
        .map(|&s| (1.0 - s).abs())
        .fold(0.0f32, f32::max);
    Ok(max_delta)
}
