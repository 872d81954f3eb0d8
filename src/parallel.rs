//! Row-partitioned parallel loops.
//!
//! Every engine call builds one [`RowPool`] of a fixed size, splits the
//! individual (row) range into contiguous chunks of `ceil(rows / threads)`
//! rows and hands each worker the sub-slice of the output buffer that holds
//! exactly its rows. Workers therefore never alias, and every dispatch
//! returns only after all chunks have completed.

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;

use crate::error::StructureError;

/// A fixed-size worker pool that runs row-chunked loops.
pub struct RowPool {
    pool: ThreadPool,
    threads: usize,
}

impl RowPool {
    pub fn new(threads: usize) -> Result<Self, StructureError> {
        if threads == 0 {
            return Err(StructureError::InvalidConfiguration(
                "thread count must be at least 1".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("glstruct-worker-{}", i))
            .build()?;
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Number of rows each worker owns when `rows` are split across the pool.
    pub fn chunk_rows(&self, rows: usize) -> usize {
        rows.div_ceil(self.threads).max(1)
    }

    /// Runs `op` over `out`, viewed as consecutive rows of `width` elements.
    ///
    /// `op` receives the global row range of its chunk and the matching
    /// sub-slice of `out`.
    pub fn for_each_rows<T, F>(&self, out: &mut [T], width: usize, op: F)
    where
        T: Send,
        F: Fn(Range<usize>, &mut [T]) + Sync,
    {
        assert!(width > 0, "row width must be positive");
        assert_eq!(out.len() % width, 0, "buffer is not a whole number of rows");
        let rows = out.len() / width;
        if rows == 0 {
            return;
        }
        let chunk = self.chunk_rows(rows);
        self.pool.install(|| {
            out.par_chunks_mut(chunk * width)
                .enumerate()
                .for_each(|(c, block)| {
                    let start = c * chunk;
                    op(start..start + block.len() / width, block);
                });
        });
    }

    /// Like [`RowPool::for_each_rows`] over two buffers sharing a row count.
    pub fn for_each_rows_zip<T, U, F>(
        &self,
        first: &mut [T],
        first_width: usize,
        second: &mut [U],
        second_width: usize,
        op: F,
    ) where
        T: Send,
        U: Send,
        F: Fn(Range<usize>, &mut [T], &mut [U]) + Sync,
    {
        assert!(first_width > 0 && second_width > 0, "row width must be positive");
        assert_eq!(first.len() % first_width, 0, "buffer is not a whole number of rows");
        let rows = first.len() / first_width;
        assert_eq!(rows * second_width, second.len(), "buffers disagree on row count");
        if rows == 0 {
            return;
        }
        let chunk = self.chunk_rows(rows);
        self.pool.install(|| {
            first
                .par_chunks_mut(chunk * first_width)
                .zip(second.par_chunks_mut(chunk * second_width))
                .enumerate()
                .for_each(|(c, (a, b))| {
                    let start = c * chunk;
                    op(start..start + a.len() / first_width, a, b);
                });
        });
    }

    /// Computes one `f64` per row in parallel and sums them in row order.
    ///
    /// The summation order is fixed, so the result does not depend on the
    /// number of threads.
    pub fn sum_rows<F>(&self, rows: usize, row_value: F) -> f64
    where
        F: Fn(usize) -> f64 + Sync,
    {
        let mut partial = vec![0.0f64; rows];
        self.for_each_rows(&mut partial, 1, |range, out| {
            for (slot, row) in out.iter_mut().zip(range) {
                *slot = row_value(row);
            }
        });
        partial.iter().sum()
    }
}

/// Row-major storage of an owned matrix the engines allocated themselves.
pub(crate) fn rows_mut<A>(matrix: &mut Array2<A>) -> &mut [A] {
    matrix
        .as_slice_mut()
        .expect("engine-owned matrices are allocated in standard layout")
}

pub(crate) fn vector_mut<A>(vector: &mut Array1<A>) -> &mut [A] {
    vector
        .as_slice_mut()
        .expect("engine-owned vectors are contiguous")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_cover_every_row_once() {
        for threads in 1..=5 {
            let pool = RowPool::new(threads).unwrap();
            let mut rows = vec![0usize; 7 * 3];
            pool.for_each_rows(&mut rows, 3, |range, block| {
                for (local, row) in range.enumerate() {
                    for slot in &mut block[local * 3..(local + 1) * 3] {
                        *slot += row + 1;
                    }
                }
            });
            for (row, chunk) in rows.chunks(3).enumerate() {
                assert!(chunk.iter().all(|&v| v == row + 1), "threads={}", threads);
            }
        }
    }

    #[test]
    fn test_zip_keeps_rows_aligned() {
        let pool = RowPool::new(3).unwrap();
        let mut wide = vec![0.0f64; 5 * 4];
        let mut narrow = vec![0usize; 5];
        pool.for_each_rows_zip(&mut wide, 4, &mut narrow, 1, |range, a, b| {
            for (local, row) in range.enumerate() {
                a[local * 4] = row as f64;
                b[local] = row;
            }
        });
        for row in 0..5 {
            assert_eq!(wide[row * 4], row as f64);
            assert_eq!(narrow[row], row);
        }
    }

    #[test]
    fn test_sum_rows_is_thread_count_invariant() {
        let value = |row: usize| 1.0 / (row as f64 + 3.0);
        let serial = RowPool::new(1).unwrap().sum_rows(101, value);
        let parallel = RowPool::new(6).unwrap().sum_rows(101, value);
        assert_eq!(serial.to_bits(), parallel.to_bits());
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            RowPool::new(0),
            Err(StructureError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_more_threads_than_rows() {
        let pool = RowPool::new(8).unwrap();
        assert_eq!(pool.chunk_rows(3), 1);
        let mut out = vec![0u8; 3];
        pool.for_each_rows(&mut out, 1, |range, block| {
            for (slot, row) in block.iter_mut().zip(range) {
                *slot = row as u8;
            }
        });
        assert_eq!(out, vec![0, 1, 2]);
    }
}
