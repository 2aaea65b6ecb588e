//! The orchestrator tying pool, strategies, breakers and retries together.

mod config;
mod rotator;

pub use config::{PersistenceConfig, RotatorConfig};
pub use rotator::{Execution, Rotator, RotatorBuilder};
