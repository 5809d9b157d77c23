use std::collections::VecDeque;

use log::warn;

use super::Forecast;
use crate::error::{Error, Result};
use crate::Vector;

/// Configures the windowed moving-average forecaster.
#[derive(Clone, Debug)]
pub struct AverageConfiguration {
    /// Number of coordinates of the observed quantity
    pub observed_dof: usize,
    /// Seconds an observation stays in the buffer
    pub window: f64,
}

/// Forecasts the arithmetic mean of the observations seen within a sliding
/// window. The most recent observation is never evicted, so the forecast
/// degrades to last-observation-carried-forward when updates stop.
pub struct Average {
    observed_dof: usize,
    window: f64,
    buffer: VecDeque<(f64, Vector)>,
    now: f64,
}

impl Average {
    pub fn new(configuration: &AverageConfiguration) -> Result<Self> {
        if configuration.window <= 0.0 {
            return Err(Error::OutOfRange {
                name: "window",
                constraint: "positive",
                value: configuration.window,
            });
        }

        Ok(Self {
            observed_dof: configuration.observed_dof,
            window: configuration.window,
            buffer: VecDeque::new(),
            now: 0.0,
        })
    }

    fn evict(&mut self) {
        while self.buffer.len() > 1 {
            match self.buffer.front() {
                Some((time, _)) if *time < self.now - self.window => {
                    self.buffer.pop_front();
                }
                _ => break,
            }
        }
    }
}

impl Forecast for Average {
    fn observe(&mut self, value: &Vector, time: f64) {
        if value.len() != self.observed_dof {
            warn!(
                "rejecting observation with {} coordinates, expected {}",
                value.len(),
                self.observed_dof
            );
            return;
        }

        // Observations older than the newest buffered one are rejected
        if let Some((newest, _)) = self.buffer.back() {
            if time < *newest {
                return;
            }
        }

        self.buffer.push_back((time, value.clone()));
        self.now = self.now.max(time);
        self.evict();
    }

    fn advance(&mut self, time: f64) {
        self.now = self.now.max(time);
        self.evict();
    }

    fn forecast(&self, _time: f64) -> Vector {
        if self.buffer.is_empty() {
            return Vector::zeros(self.observed_dof);
        }

        let mut mean = Vector::zeros(self.observed_dof);
        for (_, value) in &self.buffer {
            mean += value;
        }

        mean / self.buffer.len() as f64
    }

    fn last_update(&self) -> f64 {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn average(window: f64) -> Average {
        Average::new(&AverageConfiguration {
            observed_dof: 1,
            window,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_non_positive_window() {
        assert!(Average::new(&AverageConfiguration {
            observed_dof: 1,
            window: 0.0,
        })
        .is_err());
    }

    #[test]
    fn test_forecast_is_arithmetic_mean() {
        let mut forecast = average(10.0);
        forecast.observe(&array![1.0], 1.0);
        forecast.observe(&array![2.0], 2.0);
        forecast.observe(&array![6.0], 3.0);

        assert_eq!(forecast.forecast(3.0), array![3.0]);
    }

    #[test]
    fn test_rejects_observations_older_than_newest() {
        let mut forecast = average(10.0);
        forecast.observe(&array![1.0], 5.0);
        forecast.observe(&array![100.0], 4.0);

        assert_eq!(forecast.forecast(5.0), array![1.0]);
    }

    #[test]
    fn test_eviction_retains_most_recent() {
        let mut forecast = average(1.0);
        forecast.observe(&array![2.0], 0.0);
        forecast.observe(&array![4.0], 0.5);

        // Push time far past the window, only the newest observation stays
        for step in 0..100 {
            forecast.advance(1.0 + step as f64);
        }

        assert_eq!(forecast.forecast(100.0), array![4.0]);
        assert_eq!(forecast.last_update(), 100.0);
    }
}
