use log::warn;
use nalgebra::{linalg::try_invert_to, DMatrix};
use ndarray::s;

use super::Forecast;
use crate::error::{Error, Result};
use crate::{Matrix, Vector};

#[derive(Clone, Debug)]
pub struct KalmanConfiguration {
    // Number of observed coordinates d
    pub observed_dof: usize,
    // Highest tracked derivative n, the state covers d·(n+1) entries
    pub order: usize,
    // Seconds between predictor steps
    pub time_step: f64,
    // Seconds covered by the prediction buffer
    pub horizon: f64,
    // Process noise Q over the chained state
    pub transition_covariance: Matrix,
    // Observation noise R over the measured block
    pub observation_covariance: Matrix,
    // Initial chained state [x, ẋ, ẍ, …]
    pub initial_state: Vector,
    pub initial_covariance: Matrix,
}

// Linear predict-correct estimator over the chained state
#[derive(Clone, Debug)]
struct Filter {
    transition: Matrix,
    transition_covariance: Matrix,
    observation: Matrix,
    observation_covariance: Matrix,
    estimate: Vector,
    covariance: Matrix,
}

impl Filter {
    fn predict(&mut self) {
        self.estimate = self.transition.dot(&self.estimate);
        self.covariance = self
            .transition
            .dot(&self.covariance)
            .dot(&self.transition.t())
            + &self.transition_covariance;
    }

    fn correct(&mut self, measurement: &Vector) {
        let residual = measurement - &self.observation.dot(&self.estimate);
        let residual_covariance = self
            .observation
            .dot(&self.covariance)
            .dot(&self.observation.t())
            + &self.observation_covariance;

        // Invert the residual covariance with nalgebra
        let mut inverse = DMatrix::zeros(residual_covariance.nrows(), residual_covariance.ncols());
        if !try_invert_to(to_nalgebra(&residual_covariance), &mut inverse) {
            warn!("singular residual covariance, skipping correction");
            return;
        }

        // Optimal gain, then the corrected estimate and covariance
        let gain = self
            .covariance
            .dot(&self.observation.t())
            .dot(&from_nalgebra(&inverse));

        self.estimate = &self.estimate + &gain.dot(&residual);
        self.covariance =
            &self.covariance - &gain.dot(&self.observation).dot(&self.covariance);
    }
}

fn to_nalgebra(matrix: &Matrix) -> DMatrix<f64> {
    DMatrix::from_row_slice(
        matrix.nrows(),
        matrix.ncols(),
        matrix.as_slice().expect("matrix must be contiguous"),
    )
}

fn from_nalgebra(matrix: &DMatrix<f64>) -> Matrix {
    // nalgebra stores column-major, transpose before reading out row-major
    Matrix::from_shape_vec(
        (matrix.nrows(), matrix.ncols()),
        matrix.transpose().as_slice().to_vec(),
    )
    .expect("shape preserved by conversion")
}

// Chains the observed quantity with its derivatives. The transition
// matrix encodes Taylor integration of the chain,
// x⁽ᵏ⁾(t+Δ) = Σⱼ Δʲ/j! · x⁽ᵏ⁺ʲ⁾(t), and the observation matrix [I | 0]
// measures the zeroth derivative. A shadow copy of the filter is stepped
// across the horizon after every accepted update to refill the prediction
// buffer, which forecast interpolates without touching the filter itself.
#[derive(Debug)]
pub struct Kalman {
    observed_dof: usize,
    time_step: f64,
    horizon: f64,
    steps: usize,
    filter: Filter,
    predictor: Filter,
    // Zeroth-derivative predictions at now, now+Δ, …, now+steps·Δ
    prediction: Matrix,
    last_update: f64,
}

impl Kalman {
    pub fn new(configuration: &KalmanConfiguration) -> Result<Self> {
        if configuration.time_step <= 0.0 {
            return Err(Error::OutOfRange {
                name: "time_step",
                constraint: "positive",
                value: configuration.time_step,
            });
        }
        if configuration.horizon <= 0.0 {
            return Err(Error::OutOfRange {
                name: "horizon",
                constraint: "positive",
                value: configuration.horizon,
            });
        }

        let observed_dof = configuration.observed_dof;
        let size = observed_dof * (configuration.order + 1);

        check_shape(
            "transition_covariance",
            &configuration.transition_covariance,
            size,
            size,
        )?;
        check_shape(
            "observation_covariance",
            &configuration.observation_covariance,
            observed_dof,
            observed_dof,
        )?;
        check_shape(
            "initial_covariance",
            &configuration.initial_covariance,
            size,
            size,
        )?;
        if configuration.initial_state.len() != size {
            return Err(Error::VectorLength {
                name: "initial_state",
                expected: size,
                actual: configuration.initial_state.len(),
            });
        }

        // Taylor integration of the derivative chain
        let mut transition = Matrix::zeros((size, size));
        for block_row in 0..=configuration.order {
            let mut factor = 1.0;
            for block_col in block_row..=configuration.order {
                let derivative = block_col - block_row;
                if derivative > 0 {
                    factor *= configuration.time_step / derivative as f64;
                }
                for coordinate in 0..observed_dof {
                    transition[[
                        block_row * observed_dof + coordinate,
                        block_col * observed_dof + coordinate,
                    ]] = factor;
                }
            }
        }

        // Only the zeroth derivative is observed
        let mut observation = Matrix::zeros((observed_dof, size));
        for coordinate in 0..observed_dof {
            observation[[coordinate, coordinate]] = 1.0;
        }

        let filter = Filter {
            transition,
            transition_covariance: configuration.transition_covariance.clone(),
            observation,
            observation_covariance: configuration.observation_covariance.clone(),
            estimate: configuration.initial_state.clone(),
            covariance: configuration.initial_covariance.clone(),
        };

        let steps = (configuration.horizon / configuration.time_step).ceil() as usize;
        let mut kalman = Self {
            observed_dof,
            time_step: configuration.time_step,
            horizon: configuration.horizon,
            steps,
            predictor: filter.clone(),
            filter,
            prediction: Matrix::zeros((observed_dof, steps + 1)),
            last_update: 0.0,
        };
        kalman.repredict();

        Ok(kalman)
    }

    // Steps the shadow filter across the horizon to refill the buffer
    fn repredict(&mut self) {
        self.predictor = self.filter.clone();
        for column in 0..=self.steps {
            if column > 0 {
                self.predictor.predict();
            }
            self.prediction
                .column_mut(column)
                .assign(&self.predictor.estimate.slice(s![..self.observed_dof]));
        }
    }
}

impl Forecast for Kalman {
    fn observe(&mut self, value: &Vector, time: f64) {
        if value.len() != self.observed_dof {
            warn!(
                "rejecting observation with {} coordinates, expected {}",
                value.len(),
                self.observed_dof
            );
            return;
        }
        if time < self.last_update {
            return;
        }

        self.filter.predict();
        self.filter.correct(value);
        self.last_update = time;
        self.repredict();
    }

    fn advance(&mut self, time: f64) {
        if time < self.last_update {
            return;
        }

        self.filter.predict();
        self.last_update = time;
        self.repredict();
    }

    fn forecast(&self, time: f64) -> Vector {
        // Clamp into the buffered horizon and interpolate the bracket
        let offset = (time - self.last_update).clamp(0.0, self.horizon);
        let position = offset / self.time_step;
        let column = (position.floor() as usize).min(self.steps);
        let fraction = position - column as f64;

        if column >= self.steps || fraction == 0.0 {
            return self.prediction.column(column).to_owned();
        }

        self.prediction.column(column).to_owned() * (1.0 - fraction)
            + self.prediction.column(column + 1).to_owned() * fraction
    }

    fn last_update(&self) -> f64 {
        self.last_update
    }
}

fn check_shape(name: &'static str, matrix: &Matrix, rows: usize, cols: usize) -> Result<()> {
    if matrix.nrows() != rows || matrix.ncols() != cols {
        return Err(Error::MatrixShape {
            name,
            expected_rows: rows,
            expected_cols: cols,
            rows: matrix.nrows(),
            cols: matrix.ncols(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    fn configuration(observed_dof: usize, order: usize) -> KalmanConfiguration {
        let size = observed_dof * (order + 1);
        KalmanConfiguration {
            observed_dof,
            order,
            time_step: 0.1,
            horizon: 1.0,
            transition_covariance: Matrix::zeros((size, size)),
            observation_covariance: Matrix::eye(observed_dof) * 1e-6,
            initial_state: Vector::zeros(size),
            initial_covariance: Matrix::eye(size) * 10.0,
        }
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let mut bad = configuration(2, 1);
        bad.transition_covariance = Matrix::zeros((3, 3));
        assert!(Kalman::new(&bad).is_err());

        let mut bad = configuration(2, 1);
        bad.initial_state = Vector::zeros(3);
        assert!(Kalman::new(&bad).is_err());

        let mut bad = configuration(2, 1);
        bad.time_step = 0.0;
        assert!(Kalman::new(&bad).is_err());
    }

    #[test]
    fn test_taylor_extrapolation_round_trip() {
        // Order 2 chain started at x = 1, ẋ = 2, ẍ = -0.5 with no
        // observations: the buffer must hold the exact Taylor series
        let mut setup = configuration(1, 2);
        setup.initial_state = array![1.0, 2.0, -0.5];
        let kalman = Kalman::new(&setup).unwrap();

        for step in 0..=10 {
            let elapsed = step as f64 * 0.1;
            let expected = 1.0 + 2.0 * elapsed - 0.5 * elapsed * elapsed / 2.0;
            assert_abs_diff_eq!(kalman.forecast(elapsed)[0], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_constant_velocity_forecast() {
        // Observations x(t) = 2t at t = 0.0, 0.1, …, 1.0
        let mut kalman = Kalman::new(&configuration(1, 1)).unwrap();
        for step in 0..=10 {
            let time = step as f64 * 0.1;
            kalman.observe(&array![2.0 * time], time);
        }

        let slope = kalman.forecast(1.5)[0] - kalman.forecast(1.0)[0];
        assert_abs_diff_eq!(slope, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_forecast_clamps_to_horizon() {
        let mut setup = configuration(1, 1);
        setup.initial_state = array![0.0, 1.0];
        let kalman = Kalman::new(&setup).unwrap();

        // Inside the horizon the chain integrates, past it the value holds
        assert_abs_diff_eq!(kalman.forecast(0.5)[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(kalman.forecast(100.0)[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(kalman.forecast(-5.0)[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rejected_observation_retains_forecast() {
        let mut kalman = Kalman::new(&configuration(1, 1)).unwrap();
        kalman.observe(&array![4.0], 1.0);
        let before = kalman.forecast(1.0);

        kalman.observe(&array![100.0, 100.0], 2.0);
        assert_eq!(kalman.forecast(1.0), before);
        assert_eq!(kalman.last_update(), 1.0);
    }

    #[test]
    fn test_interpolates_between_columns() {
        let mut setup = configuration(1, 1);
        setup.initial_state = array![0.0, 2.0];
        let kalman = Kalman::new(&setup).unwrap();

        // Midway between columns at 0.1 intervals of a linear chain
        assert_abs_diff_eq!(kalman.forecast(0.05)[0], 0.1, epsilon = 1e-12);
    }
}
