use crate::error::{Error, Result};
use crate::{Matrix, Vector};

/// One-step simulator of a controlled dynamical system.
///
/// `set` reinitializes to the caller's state at the start of a rollout,
/// `step` calls chain from there, and `replicate` hands every rollout
/// worker its own independent copy.
pub trait Dynamics: Send + Sync {
    fn state_dof(&self) -> usize;

    fn control_dof(&self) -> usize;

    fn set(&mut self, state: &Vector);

    fn step(&mut self, control: &Vector, time_step: f64) -> Vector;

    fn replicate(&self) -> Box<dyn Dynamics>;
}

// Pure integrator, ẋ = u, with as many controls as states
#[derive(Clone)]
pub struct Integrator {
    state: Vector,
}

impl Integrator {
    pub fn new(dof: usize) -> Self {
        Self {
            state: Vector::zeros(dof),
        }
    }
}

impl Dynamics for Integrator {
    fn state_dof(&self) -> usize {
        self.state.len()
    }

    fn control_dof(&self) -> usize {
        self.state.len()
    }

    fn set(&mut self, state: &Vector) {
        self.state.assign(state);
    }

    fn step(&mut self, control: &Vector, time_step: f64) -> Vector {
        self.state = &self.state + &(control * time_step);
        self.state.clone()
    }

    fn replicate(&self) -> Box<dyn Dynamics> {
        Box::new(self.clone())
    }
}

// Linear time-invariant system ẋ = A·x + B·u, stepped by explicit Euler
#[derive(Clone)]
pub struct LinearDynamics {
    system: Matrix,
    input: Matrix,
    state: Vector,
}

impl LinearDynamics {
    pub fn new(system: &Matrix, input: &Matrix) -> Result<Self> {
        if system.nrows() != system.ncols() {
            return Err(Error::MatrixShape {
                name: "system",
                expected_rows: system.nrows(),
                expected_cols: system.nrows(),
                rows: system.nrows(),
                cols: system.ncols(),
            });
        }
        if input.nrows() != system.nrows() {
            return Err(Error::MatrixShape {
                name: "input",
                expected_rows: system.nrows(),
                expected_cols: input.ncols(),
                rows: input.nrows(),
                cols: input.ncols(),
            });
        }

        Ok(Self {
            system: system.clone(),
            input: input.clone(),
            state: Vector::zeros(system.nrows()),
        })
    }
}

impl Dynamics for LinearDynamics {
    fn state_dof(&self) -> usize {
        self.system.nrows()
    }

    fn control_dof(&self) -> usize {
        self.input.ncols()
    }

    fn set(&mut self, state: &Vector) {
        self.state.assign(state);
    }

    fn step(&mut self, control: &Vector, time_step: f64) -> Vector {
        let derivative = self.system.dot(&self.state) + self.input.dot(control);
        self.state = &self.state + &(derivative * time_step);
        self.state.clone()
    }

    fn replicate(&self) -> Box<dyn Dynamics> {
        Box::new(self.clone())
    }
}
