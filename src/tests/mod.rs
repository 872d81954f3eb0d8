
use itertools::Itertools;
use ndarray::{Array2, ArrayView1};

/// Pearson correlation of two equally long vectors.
pub(crate) fn pearson(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let mean_a = a.mean().unwrap_or(0.0);
    let mean_b = b.mean().unwrap_or(0.0);
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a) * (x - mean_a);
        var_b += (y - mean_b) * (y - mean_b);
    }
    cov / (var_a * var_b).sqrt()
}

/// Mean column correlation between `truth` and `estimate` under the best
/// matching of estimated to true components.
pub(crate) fn best_permutation_correlation(truth: &Array2<f64>, estimate: &Array2<f64>) -> f64 {
    let k = truth.ncols();
    assert_eq!(estimate.ncols(), k);
    (0..k)
        .permutations(k)
        .map(|perm| {
            perm.iter()
                .enumerate()
                .map(|(c, &p)| pearson(truth.column(c), estimate.column(p)))
                .sum::<f64>()
                / k as f64
        })
        .fold(f64::NEG_INFINITY, f64::max)
}
