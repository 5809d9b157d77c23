//! Forecasting of an observed vector quantity over a receding horizon.
//!
//! The controller uses this to predict the wrench applied to the
//! end-effector for the duration of each rollout. Three variants are
//! available: carrying the last observation forward, a windowed arithmetic
//! average, and a Kalman filter chaining the observed quantity with its
//! derivatives.

mod average;
mod kalman;
mod locf;

pub use crate::forecast::average::{Average, AverageConfiguration};
pub use crate::forecast::kalman::{Kalman, KalmanConfiguration};
pub use crate::forecast::locf::Locf;

use std::sync::{Arc, RwLock, Weak};

use crate::error::Result;
use crate::Vector;

/// A predictor of a timestamped vector quantity.
///
/// Wrapped in a [`SharedForecast`], readers take the shared lock and
/// writers the exclusive one, so every method is safe to reach from
/// multiple threads.
pub trait Forecast: Send + Sync {
    /// Ingests a timestamped observation.
    fn observe(&mut self, value: &Vector, time: f64);

    /// Advances internal time without a new observation.
    fn advance(&mut self, time: f64);

    /// Returns the predicted value at `time`.
    fn forecast(&self, time: f64) -> Vector;

    /// Time of the most recent accepted observation or advance.
    fn last_update(&self) -> f64;
}

pub type SharedForecast = Arc<RwLock<dyn Forecast>>;

/// Selects and parameterizes a forecast variant.
#[derive(Clone)]
pub enum Configuration {
    Locf { observed_dof: usize },
    Average(AverageConfiguration),
    Kalman(KalmanConfiguration),
}

impl Configuration {
    /// Builds the configured forecaster behind its reader-writer lock.
    pub fn create(&self) -> Result<SharedForecast> {
        Ok(match self {
            Configuration::Locf { observed_dof } => {
                Arc::new(RwLock::new(Locf::new(*observed_dof)))
            }
            Configuration::Average(configuration) => {
                Arc::new(RwLock::new(Average::new(configuration)?))
            }
            Configuration::Kalman(configuration) => {
                Arc::new(RwLock::new(Kalman::new(configuration)?))
            }
        })
    }
}

/// Non-owning, read-only view of a [`SharedForecast`].
///
/// Cost functions hold one of these instead of the forecaster itself; once
/// the owner drops the forecaster, every accessor returns `None`.
#[derive(Clone, Debug)]
pub struct Handle {
    forecast: Weak<RwLock<dyn Forecast>>,
}

impl Handle {
    pub fn new(forecast: &SharedForecast) -> Self {
        Self {
            forecast: Arc::downgrade(forecast),
        }
    }

    /// Predicted value at `time`, or `None` if the forecaster is gone.
    pub fn forecast(&self, time: f64) -> Option<Vector> {
        let shared = self.forecast.upgrade()?;
        let guard = shared.read().ok()?;
        Some(guard.forecast(time))
    }

    /// Time of the forecaster's most recent update, or `None` if it is gone.
    pub fn last_update(&self) -> Option<f64> {
        let shared = self.forecast.upgrade()?;
        let guard = shared.read().ok()?;
        Some(guard.last_update())
    }
}
