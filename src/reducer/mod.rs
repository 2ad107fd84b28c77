//! Row-range work distribution for the per-pixel phases.
//!
//! Every parallel phase of the depth map writes disjoint rows of one
//! row-major buffer while reading shared state. [`RowReducer`] captures that
//! pattern: it splits `[y_min, y_max)` into fixed-size row bands, hands each
//! band's mutable slice to the worker closure, and joins before returning.
//! The join is the only synchronization point; workers never yield.

use rayon::prelude::*;

/// Execution strategy for a [`RowReducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceBackend {
    /// Run bands in order on the calling thread. Deterministic; used in tests.
    Sequential,
    /// Run bands on the rayon worker pool.
    Threaded,
}

/// Splits row ranges into bands and runs a worker per band.
#[derive(Debug, Clone)]
pub struct RowReducer {
    backend: ReduceBackend,
    band_rows: usize,
}

impl RowReducer {
    /// Default band height, in rows.
    pub const DEFAULT_BAND_ROWS: usize = 10;

    pub fn new(backend: ReduceBackend) -> Self {
        Self {
            backend,
            band_rows: Self::DEFAULT_BAND_ROWS,
        }
    }

    pub fn threaded() -> Self {
        Self::new(ReduceBackend::Threaded)
    }

    pub fn sequential() -> Self {
        Self::new(ReduceBackend::Sequential)
    }

    /// Override the band height.
    pub fn with_band_rows(mut self, band_rows: usize) -> Self {
        assert!(band_rows > 0);
        self.band_rows = band_rows;
        self
    }

    /// Run `worker(y_start, y_end, rows)` over `[y_min, y_max)` in bands.
    ///
    /// `buf` is row-major with the given `width`; each invocation receives
    /// the mutable sub-slice covering exactly its rows. Returns after every
    /// band has completed.
    pub fn reduce<T, F>(&self, buf: &mut [T], width: usize, y_min: usize, y_max: usize, worker: F)
    where
        T: Send,
        F: Fn(usize, usize, &mut [T]) + Sync,
    {
        assert!(y_max * width <= buf.len());
        if y_min >= y_max {
            return;
        }

        let band = self.band_rows;
        let slice = &mut buf[y_min * width..y_max * width];

        match self.backend {
            ReduceBackend::Sequential => {
                for (i, rows) in slice.chunks_mut(band * width).enumerate() {
                    let y_start = y_min + i * band;
                    let y_end = (y_start + band).min(y_max);
                    worker(y_start, y_end, rows);
                }
            }
            ReduceBackend::Threaded => {
                slice
                    .par_chunks_mut(band * width)
                    .enumerate()
                    .for_each(|(i, rows)| {
                        let y_start = y_min + i * band;
                        let y_end = (y_start + band).min(y_max);
                        worker(y_start, y_end, rows);
                    });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_with_row_index(reducer: &RowReducer) -> Vec<usize> {
        let width = 7;
        let height = 23;
        let mut buf = vec![usize::MAX; width * height];

        reducer.reduce(&mut buf, width, 2, height - 3, |y_start, y_end, rows| {
            assert_eq!(rows.len(), (y_end - y_start) * width);
            for (i, cell) in rows.iter_mut().enumerate() {
                *cell = y_start + i / width;
            }
        });
        buf
    }

    #[test]
    fn test_covers_range_exactly_once() {
        for reducer in [RowReducer::sequential(), RowReducer::threaded()] {
            let width = 7;
            let buf = fill_with_row_index(&reducer.with_band_rows(4));
            for (idx, &v) in buf.iter().enumerate() {
                let y = idx / width;
                if (2..20).contains(&y) {
                    assert_eq!(v, y, "row {} misassigned", y);
                } else {
                    assert_eq!(v, usize::MAX, "row {} touched outside range", y);
                }
            }
        }
    }

    #[test]
    fn test_empty_range_is_a_noop() {
        let mut buf = vec![0u32; 12];
        RowReducer::sequential().reduce(&mut buf, 4, 2, 2, |_, _, _| panic!("must not run"));
    }

    #[test]
    fn test_band_larger_than_range() {
        let mut buf = vec![0u8; 5 * 40];
        RowReducer::sequential()
            .with_band_rows(64)
            .reduce(&mut buf, 5, 1, 39, |y_start, y_end, rows| {
                assert_eq!((y_start, y_end), (1, 39));
                assert_eq!(rows.len(), 38 * 5);
            });
    }
}
