use log::warn;

use super::Forecast;
use crate::Vector;

/// Carries the last observation forward, unchanged, for any queried time.
pub struct Locf {
    observed_dof: usize,
    last: Option<(f64, Vector)>,
}

impl Locf {
    pub fn new(observed_dof: usize) -> Self {
        Self {
            observed_dof,
            last: None,
        }
    }
}

impl Forecast for Locf {
    fn observe(&mut self, value: &Vector, time: f64) {
        if value.len() != self.observed_dof {
            warn!(
                "rejecting observation with {} coordinates, expected {}",
                value.len(),
                self.observed_dof
            );
            return;
        }

        // Out-of-order observations are ignored
        if let Some((last_time, _)) = &self.last {
            if time <= *last_time {
                return;
            }
        }

        self.last = Some((time, value.clone()));
    }

    fn advance(&mut self, _time: f64) {}

    fn forecast(&self, _time: f64) -> Vector {
        match &self.last {
            Some((_, value)) => value.clone(),
            None => Vector::zeros(self.observed_dof),
        }
    }

    fn last_update(&self) -> f64 {
        self.last.as_ref().map(|(time, _)| *time).unwrap_or(0.0)
    }
}
