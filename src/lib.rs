pub mod cost;
pub mod dynamics;
pub mod error;
pub mod forecast;
pub mod sampling;
pub mod smoothing;
pub mod trajectory;

use ndarray::{Array1, Array2};

pub type Vector = Array1<f64>;
pub type Matrix = Array2<f64>;

pub use crate::error::{Error, Result};
