//! Controller configuration.

pub mod duration;
pub mod loader;
pub mod settings;
pub mod validation;

pub use duration::{format_duration, parse_duration};
pub use loader::ConfigLoader;
pub use settings::{ControllerConfig, ControllerSettings, HealthSettings};
pub use validation::ConfigValidator;
