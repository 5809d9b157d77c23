use std::sync::{Arc, RwLock};

use crate::dynamics::Dynamics;
use crate::error::{Error, Result};
use crate::Vector;

/// Nonnegative score of a single rollout step.
///
/// `evaluate` must be deterministic given its inputs and the dynamics'
/// current state; negative or non-finite values fail the surrounding
/// rollout. `reset` runs at the start of every rollout, `replicate` hands
/// each worker thread its own copy.
pub trait Cost: Send + Sync {
    fn state_dof(&self) -> usize;

    fn control_dof(&self) -> usize;

    fn evaluate(
        &mut self,
        state: &Vector,
        control: &Vector,
        dynamics: &dyn Dynamics,
        time: f64,
    ) -> f64;

    fn replicate(&self) -> Box<dyn Cost>;

    fn reset(&mut self);
}

// Quadratic penalty on the distance to a target state and on control
// effort. The target sits behind a shared lock so a harness can retarget
// a running controller, replicas see the change on their next evaluation.
#[derive(Clone)]
pub struct Setpoint {
    target: Arc<RwLock<Vector>>,
    state_weight: Vector,
    control_weight: Vector,
}

impl Setpoint {
    pub fn new(target: Vector, state_weight: Vector, control_weight: Vector) -> Result<Self> {
        if state_weight.len() != target.len() {
            return Err(Error::VectorLength {
                name: "state_weight",
                expected: target.len(),
                actual: state_weight.len(),
            });
        }

        Ok(Self {
            target: Arc::new(RwLock::new(target)),
            state_weight,
            control_weight,
        })
    }

    pub fn retarget(&self, target: Vector) {
        *self.target.write().unwrap() = target;
    }
}

impl Cost for Setpoint {
    fn state_dof(&self) -> usize {
        self.state_weight.len()
    }

    fn control_dof(&self) -> usize {
        self.control_weight.len()
    }

    fn evaluate(
        &mut self,
        state: &Vector,
        control: &Vector,
        _dynamics: &dyn Dynamics,
        _time: f64,
    ) -> f64 {
        let target = self.target.read().unwrap();
        let error = state - &*target;

        let tracking: f64 = error
            .iter()
            .zip(self.state_weight.iter())
            .map(|(error, weight)| weight * error * error)
            .sum();
        let effort: f64 = control
            .iter()
            .zip(self.control_weight.iter())
            .map(|(control, weight)| weight * control * control)
            .sum();

        tracking + effort
    }

    fn replicate(&self) -> Box<dyn Cost> {
        Box::new(self.clone())
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;
    use crate::dynamics::Integrator;

    #[test]
    fn test_quadratic_penalty() {
        let mut cost =
            Setpoint::new(array![1.0, -1.0], array![1.0, 2.0], array![0.5, 0.5]).unwrap();
        let dynamics = Integrator::new(2);

        let value = cost.evaluate(&array![0.0, 0.0], &array![2.0, 0.0], &dynamics, 0.0);
        assert_abs_diff_eq!(value, 1.0 + 2.0 + 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_replicas_share_the_target() {
        let cost = Setpoint::new(array![0.0], array![1.0], array![0.0]).unwrap();
        let mut replica = cost.replicate();
        let dynamics = Integrator::new(1);

        cost.retarget(array![2.0]);
        let value = replica.evaluate(&array![2.0], &array![0.0], &dynamics, 0.0);
        assert_abs_diff_eq!(value, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_mismatched_weights() {
        assert!(Setpoint::new(array![0.0, 0.0], array![1.0], array![1.0]).is_err());
    }
}
