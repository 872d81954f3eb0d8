//! Dense decompositions on top of `nalgebra`.

use itertools::Itertools;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::StructureError;

/// Leading eigenpairs of a symmetric matrix, largest eigenvalue first.
#[derive(Debug, Clone)]
pub struct EigenPairs {
    pub values: Array1<f64>,
    /// One eigenvector per column.
    pub vectors: Array2<f64>,
}

fn to_nalgebra(matrix: ArrayView2<'_, f64>) -> DMatrix<f64> {
    let (rows, cols) = matrix.dim();
    DMatrix::from_fn(rows, cols, |i, j| matrix[[i, j]])
}

/// The `count` largest eigenpairs of the symmetric matrix `matrix`.
pub fn symmetric_eigen(matrix: ArrayView2<'_, f64>, count: usize) -> Result<EigenPairs, StructureError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(StructureError::ShapeMismatch {
            what: "symmetric matrix",
            expected: (rows, rows),
            found: (rows, cols),
        });
    }
    if count == 0 || count > rows {
        return Err(StructureError::InvalidRank {
            rank: count,
            bound: rows + 1,
        });
    }

    let eigen = SymmetricEigen::new(to_nalgebra(matrix));
    if eigen.eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(StructureError::Decomposition(
            "eigendecomposition produced non-finite eigenvalues".to_string(),
        ));
    }

    let order: Vec<usize> = (0..rows)
        .sorted_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]))
        .take(count)
        .collect();
    let values = order.iter().map(|&k| eigen.eigenvalues[k]).collect::<Array1<f64>>();
    let vectors = Array2::from_shape_fn((rows, count), |(i, c)| eigen.eigenvectors[(i, order[c])]);
    Ok(EigenPairs { values, vectors })
}

/// Best rank-`rank` approximation of `x` in the Frobenius norm.
///
/// Equivalent to keeping the leading `rank` singular triplets of `x`. The
/// singular vectors come from the eigendecomposition of the smaller of the
/// two Gram matrices `x xᵗ` and `xᵗ x`.
pub fn truncated_reconstruction(x: ArrayView2<'_, f64>, rank: usize) -> Result<Array2<f64>, StructureError> {
    let (m, n) = x.dim();
    let bound = m.min(n);
    if rank == 0 || rank >= bound {
        return Err(StructureError::InvalidRank { rank, bound });
    }
    if m <= n {
        let left = symmetric_eigen(x.dot(&x.t()).view(), rank)?.vectors;
        Ok(left.dot(&left.t().dot(&x)))
    } else {
        let right = symmetric_eigen(x.t().dot(&x).view(), rank)?.vectors;
        Ok(x.dot(&right).dot(&right.t()))
    }
}

/// Inverse of a square matrix.
pub fn invert(matrix: ArrayView2<'_, f64>, what: &'static str) -> Result<Array2<f64>, StructureError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(StructureError::ShapeMismatch {
            what,
            expected: (rows, rows),
            found: (rows, cols),
        });
    }
    let inverse = to_nalgebra(matrix)
        .try_inverse()
        .ok_or(StructureError::SingularMatrix(what))?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(StructureError::SingularMatrix(what));
    }
    Ok(Array2::from_shape_fn((rows, cols), |(i, j)| inverse[(i, j)]))
}

/// Scales every column of `vectors` by the square root of the matching
/// (non-negative part of the) eigenvalue.
pub fn loadings(pairs: &EigenPairs) -> Array2<f64> {
    let mut loadings = pairs.vectors.clone();
    for (mut column, &value) in loadings.axis_iter_mut(Axis(1)).zip(pairs.values.iter()) {
        column *= value.max(0.0).sqrt();
    }
    loadings
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_eigenvalues_sorted_descending() {
        let matrix = array![[2.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 1.0]];
        let pairs = symmetric_eigen(matrix.view(), 3).unwrap();
        assert!((pairs.values[0] - 5.0).abs() < 1e-12);
        assert!((pairs.values[1] - 2.0).abs() < 1e-12);
        assert!((pairs.values[2] - 1.0).abs() < 1e-12);
        assert!((pairs.vectors[[1, 0]].abs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_eigenvectors_reconstruct_matrix() {
        let matrix = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let pairs = symmetric_eigen(matrix.view(), 3).unwrap();
        let load = loadings(&pairs);
        let rebuilt = load.dot(&load.t());
        for (a, b) in rebuilt.iter().zip(matrix.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn test_rank_one_matrix_is_reproduced() {
        let u = array![[1.0], [2.0], [-1.0]];
        let v = array![[0.5, -1.0, 2.0, 0.0, 1.0]];
        let x = u.dot(&v);
        for view in [x.view(), x.t()] {
            let rebuilt = truncated_reconstruction(view, 1).unwrap();
            for (a, b) in rebuilt.iter().zip(view.iter()) {
                assert!((a - b).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_invalid_rank() {
        let x = Array2::<f64>::zeros((3, 5));
        assert!(matches!(
            truncated_reconstruction(x.view(), 0),
            Err(StructureError::InvalidRank { rank: 0, bound: 3 })
        ));
        assert!(matches!(
            truncated_reconstruction(x.view(), 3),
            Err(StructureError::InvalidRank { rank: 3, bound: 3 })
        ));
    }

    #[test]
    fn test_invert() {
        let matrix = array![[2.0, 1.0], [1.0, 3.0]];
        let inverse = invert(matrix.view(), "test").unwrap();
        let identity = matrix.dot(&inverse);
        assert!((identity[[0, 0]] - 1.0).abs() < 1e-12);
        assert!(identity[[0, 1]].abs() < 1e-12);

        let singular = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(matches!(
            invert(singular.view(), "test"),
            Err(StructureError::SingularMatrix("test"))
        ));
    }
}
