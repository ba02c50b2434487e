//! Distribution generators for the workload drivers
//!
//! The drivers pre-generate their whole sequences before timing starts,
//! so generation cost never shows up in the measured throughput.

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::Rng;

/// `count` Zipf-distributed indices over `[0, n)` with the given skew.
/// A skew of 0 degenerates to the uniform distribution.
///
/// Sampling is by inverse CDF: the cumulative weights are computed once,
/// then each sample is a binary search.
pub fn zipf(n: u64, skew: f64, count: usize, rng: &mut StdRng) -> Vec<u64> {
    assert!(n > 0, "zipf over an empty range");

    let mut cdf = Vec::with_capacity(n as usize);
    let mut sum = 0.0;
    for i in 1..=n {
        sum += 1.0 / (i as f64).powf(skew);
        cdf.push(sum);
    }
    let zeta = sum;

    (0..count)
        .map(|_| {
            let u = rng.gen::<f64>() * zeta;
            (cdf.partition_point(|&c| c < u) as u64).min(n - 1)
        })
        .collect()
}

/// `count` uniform samples in `[0, 1)`.
pub fn uniform(count: usize, rng: &mut StdRng) -> Vec<f64> {
    (0..count).map(|_| rng.gen::<f64>()).collect()
}

/// A random alphanumeric value of `len` bytes (loader values).
pub fn random_value(len: usize, rng: &mut StdRng) -> Bytes {
    let value: Vec<u8> = (0..len).map(|_| rng.sample(Alphanumeric)).collect();
    Bytes::from(value)
}
