use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Error, Result};
use crate::{Matrix, Vector};

// Draws from N(0, Σ) by applying V·Λ^{½} from the eigen-decomposition of
// the covariance to independent standard normals, one matrix-vector
// product per draw.
pub struct Gaussian {
    // V·Λ^{½} with eigenvalues clamped at zero against round-off
    transform: Matrix,
    rng: ChaCha8Rng,
}

impl Gaussian {
    pub fn new(covariance: &Matrix) -> Result<Self> {
        Self::with_rng(covariance, ChaCha8Rng::from_os_rng())
    }

    // Reproducible stream for a fixed seed
    pub fn seeded(covariance: &Matrix, seed: u64) -> Result<Self> {
        Self::with_rng(covariance, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(covariance: &Matrix, rng: ChaCha8Rng) -> Result<Self> {
        if covariance.nrows() != covariance.ncols() {
            return Err(Error::NonSquareCovariance {
                rows: covariance.nrows(),
                cols: covariance.ncols(),
            });
        }

        let dimension = covariance.nrows();

        // ndarray has no eigen-solver, so hop over to nalgebra for the
        // decomposition and come back in row-major order
        let eigen = DMatrix::from_row_slice(
            dimension,
            dimension,
            covariance.as_slice().expect("covariance must be contiguous"),
        )
        .symmetric_eigen();

        // A positive-semidefinite covariance can pick up slightly negative
        // eigenvalues from round-off, clamp those to zero before the root
        let roots = DMatrix::from_diagonal(&eigen.eigenvalues.map(|value: f64| value.max(0.0).sqrt()));
        let transform = &eigen.eigenvectors * roots;

        Ok(Self {
            transform: Matrix::from_shape_vec(
                (dimension, dimension),
                transform.transpose().as_slice().to_vec(),
            )
            .expect("eigenvector matrix must match covariance shape"),
            rng,
        })
    }

    pub fn dimension(&self) -> usize {
        self.transform.nrows()
    }

    pub fn sample(&mut self) -> Vector {
        let standard = Vector::from_iter(
            (0..self.dimension()).map(|_| StandardNormal.sample(&mut self.rng)),
        );

        self.transform.dot(&standard)
    }
}
