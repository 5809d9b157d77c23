use nalgebra::{linalg::try_invert_to, DMatrix};

use crate::error::{Error, Result};
use crate::{Matrix, Vector};

/// Configures Savitzky-Golay smoothing of the nominal trajectory.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Odd number of samples fitted at a time
    pub window: usize,
    /// Degree of the fitted polynomial, below the window length
    pub order: usize,
}

/// Least-squares polynomial smoother.
///
/// Construction precomputes the projection A·(AᵀA)⁻¹·Aᵀ of a window onto
/// polynomials of the configured degree. Interior samples take the center
/// row of the projection, the first and last half-window samples the
/// asymmetric edge rows, so polynomials up to `order` pass through
/// unchanged everywhere.
pub struct SavitzkyGolay {
    window: usize,
    half: usize,
    projection: Matrix,
}

impl SavitzkyGolay {
    pub fn new(configuration: &Configuration) -> Result<Self> {
        if configuration.window < 3 || configuration.window % 2 == 0 {
            return Err(Error::OutOfRange {
                name: "window",
                constraint: "odd and at least 3",
                value: configuration.window as f64,
            });
        }
        if configuration.order == 0 || configuration.order >= configuration.window {
            return Err(Error::OutOfRange {
                name: "order",
                constraint: "between 1 and window - 1",
                value: configuration.order as f64,
            });
        }

        let window = configuration.window;
        let half = window / 2;
        let terms = configuration.order + 1;

        // Vandermonde basis over centered sample offsets
        let mut basis = DMatrix::zeros(window, terms);
        for row in 0..window {
            let offset = row as f64 - half as f64;
            let mut power = 1.0;
            for term in 0..terms {
                basis[(row, term)] = power;
                power *= offset;
            }
        }

        let normal = basis.transpose() * &basis;
        let mut inverse = DMatrix::zeros(terms, terms);
        if !try_invert_to(normal, &mut inverse) {
            return Err(Error::OutOfRange {
                name: "order",
                constraint: "low enough for a well-conditioned fit",
                value: configuration.order as f64,
            });
        }

        let projection = &basis * inverse * basis.transpose();

        Ok(Self {
            window,
            half,
            projection: Matrix::from_shape_vec(
                (window, window),
                projection.transpose().as_slice().to_vec(),
            )
            .expect("projection must be window-square"),
        })
    }

    /// Smooths one signal; signals shorter than the window pass through.
    pub fn smooth(&self, signal: &Vector) -> Vector {
        let length = signal.len();
        if length < self.window {
            return signal.clone();
        }

        let mut smoothed = Vector::zeros(length);
        for index in 0..length {
            // Clamp the window inside the signal and pick the matching row
            let (start, row) = if index < self.half {
                (0, index)
            } else if index + self.half >= length {
                (length - self.window, self.window - 1 - (length - 1 - index))
            } else {
                (index - self.half, self.half)
            };

            smoothed[index] = (0..self.window)
                .map(|offset| self.projection[[row, offset]] * signal[start + offset])
                .sum();
        }

        smoothed
    }

    /// Smooths every row of a matrix in place.
    pub fn smooth_rows(&self, matrix: &mut Matrix) {
        for mut row in matrix.rows_mut() {
            let smoothed = self.smooth(&row.to_owned());
            row.assign(&smoothed);
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    fn smoother(window: usize, order: usize) -> SavitzkyGolay {
        SavitzkyGolay::new(&Configuration { window, order }).unwrap()
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(SavitzkyGolay::new(&Configuration { window: 4, order: 2 }).is_err());
        assert!(SavitzkyGolay::new(&Configuration { window: 5, order: 0 }).is_err());
        assert!(SavitzkyGolay::new(&Configuration { window: 5, order: 5 }).is_err());
    }

    #[test]
    fn test_constant_signal_is_a_fixed_point() {
        let smoother = smoother(5, 2);
        let signal = Vector::from_elem(12, 3.5);

        let smoothed = smoother.smooth(&signal);
        for value in smoothed.iter() {
            assert_abs_diff_eq!(*value, 3.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_polynomial_within_order_passes_unchanged() {
        let smoother = smoother(7, 3);
        let signal =
            Vector::from_iter((0..20).map(|k| 0.5 + 1.5 * k as f64 - 0.2 * (k as f64).powi(2)));

        let smoothed = smoother.smooth(&signal);
        for (before, after) in signal.iter().zip(smoothed.iter()) {
            assert_abs_diff_eq!(*after, *before, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_short_signals_pass_through() {
        let smoother = smoother(7, 2);
        let signal = array![1.0, -2.0, 3.0];
        assert_eq!(smoother.smooth(&signal), signal);
    }

    #[test]
    fn test_smooths_rows_in_place() {
        let smoother = smoother(3, 1);
        let mut matrix = Matrix::from_shape_fn((2, 9), |(row, col)| {
            (row + 1) as f64 * col as f64 + if col % 2 == 0 { 0.1 } else { -0.1 }
        });
        let noisy = matrix.clone();

        smoother.smooth_rows(&mut matrix);

        // The zig-zag shrinks while the linear trend is preserved
        for row in 0..2 {
            let before: f64 = (1..8)
                .map(|col| (noisy[[row, col]] - (row + 1) as f64 * col as f64).abs())
                .sum();
            let after: f64 = (1..8)
                .map(|col| (matrix[[row, col]] - (row + 1) as f64 * col as f64).abs())
                .sum();
            assert!(after < before);
        }
    }
}
