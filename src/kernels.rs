//! Distance kernels used for convergence checks.
//!
//! The matrix kernels reduce one partial sum per row on the [`RowPool`] and
//! combine the partials in row order. They accept any pair of element types
//! that widen to `f64`, which covers the `f32` frequency matrices of the
//! covariance engine as well as the `f64` factors of the admixture engine.

use ndarray::{ArrayView1, ArrayView2, Zip};

use crate::parallel::RowPool;

/// Sum of squared elementwise differences between `a` and `b`.
///
/// Panics if the shapes differ.
pub fn sum_squared_difference<A, B>(a: ArrayView2<'_, A>, b: ArrayView2<'_, B>, pool: &RowPool) -> f64
where
    A: Copy + Into<f64> + Sync,
    B: Copy + Into<f64> + Sync,
{
    assert_eq!(a.dim(), b.dim(), "distance kernel called on matrices of different shape");
    pool.sum_rows(a.nrows(), |i| {
        a.row(i)
            .iter()
            .zip(b.row(i).iter())
            .map(|(&x, &y)| {
                let d = x.into() - y.into();
                d * d
            })
            .sum()
    })
}

/// Root-mean-square difference over all elements.
pub fn rmse<A, B>(a: ArrayView2<'_, A>, b: ArrayView2<'_, B>, pool: &RowPool) -> f64
where
    A: Copy + Into<f64> + Sync,
    B: Copy + Into<f64> + Sync,
{
    let elements = a.len();
    if elements == 0 {
        assert_eq!(a.dim(), b.dim(), "distance kernel called on matrices of different shape");
        return 0.0;
    }
    (sum_squared_difference(a, b, pool) / elements as f64).sqrt()
}

/// Frobenius norm of `a - b`.
pub fn frobenius<A, B>(a: ArrayView2<'_, A>, b: ArrayView2<'_, B>, pool: &RowPool) -> f64
where
    A: Copy + Into<f64> + Sync,
    B: Copy + Into<f64> + Sync,
{
    sum_squared_difference(a, b, pool).sqrt()
}

/// Single-threaded Frobenius norm of `a - b`, for small factor blocks.
pub fn frobenius_serial(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> f64 {
    assert_eq!(a.dim(), b.dim(), "distance kernel called on matrices of different shape");
    let mut total = 0.0;
    Zip::from(&a).and(&b).for_each(|&x, &y| total += (x - y) * (x - y));
    total.sqrt()
}

/// Root-mean-square difference between two vectors.
pub fn rmse_vector(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    assert_eq!(a.len(), b.len(), "distance kernel called on vectors of different length");
    if a.is_empty() {
        return 0.0;
    }
    let total: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    (total / a.len() as f64).sqrt()
}
