use std::sync::{Arc, Mutex};

use itertools::Itertools;
use log::warn;
use ndarray::{s, ArrayView2, ArrayViewMut2};
use rayon::prelude::*;

use crate::cost::Cost;
use crate::dynamics::Dynamics;
use crate::error::{Error, Result};
use crate::sampling::Gaussian;
use crate::smoothing::{self, SavitzkyGolay};
use crate::{Matrix, Vector};

#[derive(Clone, Debug)]
pub struct Configuration {
    // Total trajectories per cycle, including the two reserved slots
    pub rollouts: usize,
    // Number of best rollouts carried over into the next cycle
    pub keep_best_rollouts: usize,
    // Seconds between trajectory columns
    pub time_step: f64,
    // Seconds covered by each rollout
    pub horizon: f64,
    // Rollout worker threads, zero for one per core
    pub threads: usize,
    // Blending factor of the weighted-noise update
    pub gradient_step: f64,
    // Per-coordinate clamp on the update increment
    pub gradient_minmax: f64,
    // λ of the exponential weighting
    pub cost_scale: f64,
    // γ multiplying the cost of step k by γᵏ
    pub cost_discount_factor: f64,
    // Covariance of the sampled control noise
    pub covariance: Matrix,
    // Clamp the nominal trajectory to [control_min, control_max]
    pub control_bound: bool,
    pub control_min: Vector,
    pub control_max: Vector,
    // Past the horizon, emit the last column instead of the default value
    pub control_default_last: bool,
    pub control_default_value: Vector,
    // Optional Savitzky-Golay smoothing of the updated nominal
    pub smoothing: Option<smoothing::Configuration>,
    // Fixed sampler seed for reproducible runs
    pub seed: Option<u64>,
    // Spread uniform weight over surviving rollouts when every weight
    // underflows, instead of keeping the nominal and warning
    pub uniform_weight_fallback: bool,
}

#[derive(Debug)]
struct Published {
    nominal: Matrix,
    rollout_time: f64,
}

// Evaluators share the published buffer, so they only ever contend with
// the bounded publish copy at the end of a cycle, never with rollouts
#[derive(Clone, Debug)]
pub struct TrajectoryView {
    published: Arc<Mutex<Published>>,
    time_step: f64,
    steps: usize,
    control_default_last: bool,
    control_default_value: Vector,
}

impl TrajectoryView {
    pub fn evaluate(&self, time: f64) -> Vector {
        let mut control = Vector::zeros(self.control_default_value.len());
        self.evaluate_into(time, &mut control);
        control
    }

    pub fn evaluate_into(&self, time: f64, control: &mut Vector) {
        let published = self.published.lock().unwrap();
        let position = (time - published.rollout_time) / self.time_step;

        // Before the trajectory starts, the first control applies
        if position <= 0.0 {
            control.assign(&published.nominal.column(0));
            return;
        }

        let column = position.floor() as usize;

        // Past the horizon, the configured default applies
        if column >= self.steps {
            match self.control_default_last {
                true => control.assign(&published.nominal.column(self.steps - 1)),
                false => control.assign(&self.control_default_value),
            }
            return;
        }

        control.assign(&published.nominal.column(column));

        let fraction = position - column as f64;
        if fraction > 0.0 {
            let next = if column + 1 < self.steps {
                published.nominal.column(column + 1).to_owned()
            } else if self.control_default_last {
                published.nominal.column(self.steps - 1).to_owned()
            } else {
                self.control_default_value.clone()
            };
            control.zip_mut_with(&next, |current, next| {
                *current = (1.0 - fraction) * *current + fraction * *next;
            });
        }
    }

    pub fn current_trajectory(&self) -> Matrix {
        self.published.lock().unwrap().nominal.clone()
    }

    pub fn rollout_time(&self) -> f64 {
        self.published.lock().unwrap().rollout_time
    }
}

// Sampling-based model-predictive trajectory optimizer. Every update
// simulates perturbed candidate trajectories against the dynamics in
// parallel, scores them with the cost, and blends the nominal toward the
// exponentially weighted mean of the samples. Slot 0 carries no noise so
// the nominal is always among the candidates, slot 1 carries the negated
// previous update to counteract drift along noise modes.
pub struct Trajectory {
    configuration: Configuration,
    dynamics: Box<dyn Dynamics>,
    cost: Box<dyn Cost>,
    sampler: Gaussian,
    pool: rayon::ThreadPool,
    smoother: Option<SavitzkyGolay>,

    control_dof: usize,
    steps: usize,

    // State the next rollouts start from
    state: Vector,
    // Time of the first trajectory column
    rollout_time: f64,
    nominal: Matrix,
    // Noise of every rollout, stacked in row blocks of control_dof rows
    noise: Matrix,
    costs: Vec<f64>,
    weights: Vec<f64>,
    // Change applied to the nominal by the previous cycle
    last_step: Matrix,
    // Rollout indices of the previous cycle, best first
    ordered: Vec<usize>,

    published: Arc<Mutex<Published>>,
}

impl Trajectory {
    pub fn new(
        dynamics: Box<dyn Dynamics>,
        cost: Box<dyn Cost>,
        configuration: &Configuration,
        state: &Vector,
        time: f64,
    ) -> Result<Self> {
        if dynamics.state_dof() != cost.state_dof() {
            return Err(Error::CapabilityMismatch {
                what: "state_dof",
                dynamics: dynamics.state_dof(),
                cost: cost.state_dof(),
            });
        }
        if dynamics.control_dof() != cost.control_dof() {
            return Err(Error::CapabilityMismatch {
                what: "control_dof",
                dynamics: dynamics.control_dof(),
                cost: cost.control_dof(),
            });
        }

        let control_dof = dynamics.control_dof();
        validate(configuration, control_dof)?;

        if state.len() != dynamics.state_dof() {
            return Err(Error::VectorLength {
                name: "state",
                expected: dynamics.state_dof(),
                actual: state.len(),
            });
        }

        let steps = (configuration.horizon / configuration.time_step).ceil() as usize;
        let rollouts = configuration.rollouts;

        let sampler = match configuration.seed {
            Some(seed) => Gaussian::seeded(&configuration.covariance, seed)?,
            None => Gaussian::new(&configuration.covariance)?,
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(configuration.threads)
            .build()
            .map_err(|error| Error::WorkerPool(error.to_string()))?;

        let smoother = configuration
            .smoothing
            .as_ref()
            .map(SavitzkyGolay::new)
            .transpose()?;

        // Until the first update, the nominal repeats the default control
        let mut nominal = Matrix::zeros((control_dof, steps));
        for mut column in nominal.columns_mut() {
            column.assign(&configuration.control_default_value);
        }

        let published = Arc::new(Mutex::new(Published {
            nominal: nominal.clone(),
            rollout_time: time,
        }));

        Ok(Self {
            configuration: configuration.clone(),
            dynamics,
            cost,
            sampler,
            pool,
            smoother,
            control_dof,
            steps,
            state: state.clone(),
            rollout_time: time,
            nominal,
            noise: Matrix::zeros((rollouts * control_dof, steps)),
            costs: vec![0.0; rollouts],
            weights: vec![0.0; rollouts],
            last_step: Matrix::zeros((control_dof, steps)),
            ordered: vec![],
            published,
        })
    }

    // One full optimization cycle from state at time. Never fails:
    // rollouts that diverge score +∞ and lose their weight, a cycle in
    // which every rollout failed leaves the nominal unchanged.
    pub fn update(&mut self, state: &Vector, time: f64) {
        if state.len() != self.state.len() {
            warn!(
                "ignoring update with state of length {}, expected {}",
                state.len(),
                self.state.len()
            );
            return;
        }
        self.state.assign(state);

        let shift = self.shift(time);
        self.sample(shift);
        self.rollout();
        if self.reweight() {
            self.descend();
        }
        self.publish();
    }

    // Realigns the trajectory with the caller's clock. Shifts whole
    // columns only, so column 0 always covers the next control interval
    // and rollout_time stays on the step grid.
    fn shift(&mut self, time: f64) -> usize {
        let elapsed = (time - self.rollout_time).max(0.0);
        let shift = (elapsed / self.configuration.time_step).floor() as usize;
        if shift == 0 {
            return 0;
        }

        self.rollout_time += shift as f64 * self.configuration.time_step;
        let shift = shift.min(self.steps);

        let fill = if self.configuration.control_default_last {
            self.nominal.column(self.steps - 1).to_owned()
        } else {
            self.configuration.control_default_value.clone()
        };
        shift_columns(self.nominal.view_mut(), shift, &fill);

        // The anti-optimum refers to trajectory columns, shift it along
        shift_columns(
            self.last_step.view_mut(),
            shift,
            &Vector::zeros(self.control_dof),
        );

        shift
    }

    // Refills the rollout noise bank
    fn sample(&mut self, shift: usize) {
        let control_dof = self.control_dof;
        let steps = self.steps;
        let keep = self.configuration.keep_best_rollouts;
        let rollouts = self.configuration.rollouts;

        // Pull the previous best blocks out before they are overwritten
        let kept: Vec<Matrix> = self
            .ordered
            .iter()
            .take(keep)
            .map(|&index| {
                self.noise
                    .slice(s![index * control_dof..(index + 1) * control_dof, ..])
                    .to_owned()
            })
            .collect();

        let Self {
            ref mut noise,
            ref mut sampler,
            ref last_step,
            ..
        } = *self;

        // Slot 0 scores the unperturbed nominal
        noise.slice_mut(s![..control_dof, ..]).fill(0.0);

        // Slot 1 counteracts the previous update
        noise
            .slice_mut(s![control_dof..2 * control_dof, ..])
            .assign(&-last_step);

        // Warm-started slots move with the time shift, only the freed
        // tail columns are sampled fresh
        let mut slot = 2;
        for block in &kept {
            let mut target =
                noise.slice_mut(s![slot * control_dof..(slot + 1) * control_dof, ..]);
            for column in 0..steps - shift {
                target.column_mut(column).assign(&block.column(column + shift));
            }
            for column in steps - shift..steps {
                target.column_mut(column).assign(&sampler.sample());
            }
            slot += 1;
        }

        // Every remaining slot is resampled column by column
        for index in slot..rollouts {
            let mut block =
                noise.slice_mut(s![index * control_dof..(index + 1) * control_dof, ..]);
            for column in 0..steps {
                block.column_mut(column).assign(&sampler.sample());
            }
        }
    }

    // Scores every rollout on the worker pool
    fn rollout(&mut self) {
        let control_dof = self.control_dof;
        let steps = self.steps;
        let time_step = self.configuration.time_step;
        let discount = self.configuration.cost_discount_factor;
        let rollout_time = self.rollout_time;

        let Self {
            ref mut costs,
            ref dynamics,
            ref cost,
            ref nominal,
            ref noise,
            ref state,
            ref pool,
            ..
        } = *self;

        pool.install(|| {
            costs.par_iter_mut().enumerate().for_each_init(
                || (dynamics.replicate(), cost.replicate()),
                |(dynamics, cost), (index, total)| {
                    let block =
                        noise.slice(s![index * control_dof..(index + 1) * control_dof, ..]);
                    *total = simulate(
                        &mut **dynamics,
                        &mut **cost,
                        state,
                        nominal,
                        block,
                        steps,
                        time_step,
                        discount,
                        rollout_time,
                    );
                },
            )
        });

        let failed = self.costs.iter().filter(|cost| !cost.is_finite()).count();
        if failed > 0 {
            warn!("{failed} of {} rollouts diverged", self.costs.len());
        }
    }

    // Exponential weighting of the rollout costs. False when the cycle
    // produced nothing to descend along.
    fn reweight(&mut self) -> bool {
        let minimum = self
            .costs
            .iter()
            .cloned()
            .filter(|cost| cost.is_finite())
            .fold(f64::INFINITY, f64::min);

        if !minimum.is_finite() {
            self.weights.fill(0.0);
            // Failed costs carry no ranking information for warm starts
            self.ordered.clear();
            warn!("every rollout failed, keeping the nominal trajectory");
            return false;
        }

        self.ordered = (0..self.costs.len())
            .sorted_by(|&left, &right| self.costs[left].total_cmp(&self.costs[right]))
            .collect();

        let scale = self.configuration.cost_scale;
        let mut sum = 0.0;
        for (weight, cost) in self.weights.iter_mut().zip(&self.costs) {
            *weight = match cost.is_finite() {
                true => (-(cost - minimum) / scale).exp(),
                false => 0.0,
            };
            sum += *weight;
        }

        // exp(0) = 1 at the minimum, so this needs every weight to underflow
        if sum <= 0.0 {
            if !self.configuration.uniform_weight_fallback {
                warn!("weights collapsed to zero, keeping the nominal trajectory");
                return false;
            }

            let survivors = self.costs.iter().filter(|cost| cost.is_finite()).count();
            for (weight, cost) in self.weights.iter_mut().zip(&self.costs) {
                *weight = match cost.is_finite() {
                    true => 1.0 / survivors as f64,
                    false => 0.0,
                };
            }
            return true;
        }

        for weight in &mut self.weights {
            *weight /= sum;
        }

        true
    }

    // Blends the nominal toward the weighted mean of the noise
    fn descend(&mut self) {
        let control_dof = self.control_dof;
        let previous = self.nominal.clone();

        let mut gradient = Matrix::zeros((control_dof, self.steps));
        for (index, weight) in self.weights.iter().enumerate() {
            let weight = *weight;
            if weight == 0.0 {
                continue;
            }
            let block = self
                .noise
                .slice(s![index * control_dof..(index + 1) * control_dof, ..]);
            gradient.zip_mut_with(&block, |gradient, noise| *gradient += weight * noise);
        }

        let limit = self.configuration.gradient_minmax;
        gradient.mapv_inplace(|value| value.clamp(-limit, limit));

        self.nominal
            .scaled_add(self.configuration.gradient_step, &gradient);

        if let Some(smoother) = &self.smoother {
            smoother.smooth_rows(&mut self.nominal);
        }

        if self.configuration.control_bound {
            let minimum = &self.configuration.control_min;
            let maximum = &self.configuration.control_max;
            for mut column in self.nominal.columns_mut() {
                for (coordinate, value) in column.iter_mut().enumerate() {
                    *value = value.clamp(minimum[coordinate], maximum[coordinate]);
                }
            }
        }

        self.last_step = &self.nominal - &previous;
    }

    // Swaps the refined trajectory in for evaluators
    fn publish(&self) {
        let mut published = self.published.lock().unwrap();
        published.nominal.assign(&self.nominal);
        published.rollout_time = self.rollout_time;
    }

    pub fn view(&self) -> TrajectoryView {
        TrajectoryView {
            published: self.published.clone(),
            time_step: self.configuration.time_step,
            steps: self.steps,
            control_default_last: self.configuration.control_default_last,
            control_default_value: self.configuration.control_default_value.clone(),
        }
    }

    pub fn evaluate(&self, time: f64) -> Vector {
        self.view().evaluate(time)
    }

    pub fn evaluate_into(&self, time: f64, control: &mut Vector) {
        self.view().evaluate_into(time, control)
    }

    pub fn current_trajectory(&self) -> Matrix {
        self.published.lock().unwrap().nominal.clone()
    }

    pub fn rollout_time(&self) -> f64 {
        self.rollout_time
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn control_dof(&self) -> usize {
        self.control_dof
    }

    pub fn rollouts(&self) -> usize {
        self.configuration.rollouts
    }

    pub fn rollout_noise(&self, index: usize) -> Matrix {
        self.noise
            .slice(s![
                index * self.control_dof..(index + 1) * self.control_dof,
                ..
            ])
            .to_owned()
    }

    pub fn rollout_cost(&self, index: usize) -> f64 {
        self.costs[index]
    }

    pub fn rollout_weight(&self, index: usize) -> f64 {
        self.weights[index]
    }
}

// Simulates one rollout and returns its discounted cumulative cost. A
// non-finite state or a non-finite or negative step cost fails the
// rollout with +∞, which zeroes its weight later.
#[allow(clippy::too_many_arguments)]
fn simulate(
    dynamics: &mut dyn Dynamics,
    cost: &mut dyn Cost,
    initial: &Vector,
    nominal: &Matrix,
    noise: ArrayView2<f64>,
    steps: usize,
    time_step: f64,
    discount: f64,
    rollout_time: f64,
) -> f64 {
    dynamics.set(initial);
    cost.reset();

    let mut state = initial.clone();
    let mut discounting = 1.0;
    let mut total = 0.0;

    for column in 0..steps {
        let control = &nominal.column(column) + &noise.column(column);

        let step_cost = cost.evaluate(
            &state,
            &control,
            &*dynamics,
            rollout_time + column as f64 * time_step,
        );
        if !step_cost.is_finite() || step_cost < 0.0 {
            return f64::INFINITY;
        }
        total += discounting * step_cost;

        state = dynamics.step(&control, time_step);
        if state.iter().any(|value| !value.is_finite()) {
            return f64::INFINITY;
        }

        discounting *= discount;
    }

    total
}

// Moves every column shift places to the left and fills the freed
// columns on the right
fn shift_columns(mut matrix: ArrayViewMut2<f64>, shift: usize, fill: &Vector) {
    let columns = matrix.ncols();
    for column in 0..columns - shift {
        let source = matrix.column(column + shift).to_owned();
        matrix.column_mut(column).assign(&source);
    }
    for column in columns - shift..columns {
        matrix.column_mut(column).assign(fill);
    }
}

fn validate(configuration: &Configuration, control_dof: usize) -> Result<()> {
    if configuration.rollouts < 2 {
        return Err(Error::TooFewRollouts(configuration.rollouts));
    }
    if configuration.keep_best_rollouts + 2 > configuration.rollouts {
        return Err(Error::TooManyKeptRollouts {
            requested: configuration.keep_best_rollouts,
            limit: configuration.rollouts - 2,
        });
    }

    for (name, value) in [
        ("time_step", configuration.time_step),
        ("horizon", configuration.horizon),
        ("gradient_minmax", configuration.gradient_minmax),
        ("cost_scale", configuration.cost_scale),
    ] {
        if value <= 0.0 {
            return Err(Error::OutOfRange {
                name,
                constraint: "positive",
                value,
            });
        }
    }

    for (name, value) in [
        ("gradient_step", configuration.gradient_step),
        ("cost_discount_factor", configuration.cost_discount_factor),
    ] {
        if value <= 0.0 || value > 1.0 {
            return Err(Error::OutOfRange {
                name,
                constraint: "in (0, 1]",
                value,
            });
        }
    }

    if configuration.covariance.nrows() != configuration.covariance.ncols() {
        return Err(Error::NonSquareCovariance {
            rows: configuration.covariance.nrows(),
            cols: configuration.covariance.ncols(),
        });
    }
    if configuration.covariance.nrows() != control_dof {
        return Err(Error::MatrixShape {
            name: "covariance",
            expected_rows: control_dof,
            expected_cols: control_dof,
            rows: configuration.covariance.nrows(),
            cols: configuration.covariance.ncols(),
        });
    }

    if configuration.control_default_value.len() != control_dof {
        return Err(Error::VectorLength {
            name: "control_default_value",
            expected: control_dof,
            actual: configuration.control_default_value.len(),
        });
    }

    if configuration.control_bound {
        if configuration.control_min.len() != control_dof {
            return Err(Error::VectorLength {
                name: "control_min",
                expected: control_dof,
                actual: configuration.control_min.len(),
            });
        }
        if configuration.control_max.len() != control_dof {
            return Err(Error::VectorLength {
                name: "control_max",
                expected: control_dof,
                actual: configuration.control_max.len(),
            });
        }
        for coordinate in 0..control_dof {
            if configuration.control_min[coordinate] > configuration.control_max[coordinate] {
                return Err(Error::EmptyControlBound {
                    coordinate,
                    min: configuration.control_min[coordinate],
                    max: configuration.control_max[coordinate],
                });
            }
        }
    }

    Ok(())
}
