//! Cap-pressure estimator: forecasts minutes until quota exhaustion.

mod pressure;
mod types;

pub use pressure::{CapPressureEstimator, MAX_ETA_MINUTES, MIN_ETA_MINUTES};
pub use types::{CapEta, CapPressureState, EtaMethod, Severity, WindowSnapshot};
