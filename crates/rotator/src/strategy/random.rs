use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::RotationStrategy;
use crate::errors::RotatorError;
use crate::models::{Endpoint, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::Result;

/// Uniform random choice using the thread-local RNG.
#[derive(Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl RotationStrategy for RandomStrategy {
    fn select(
        &self,
        candidates: &PoolSnapshot,
        _context: &SelectionContext,
    ) -> Result<Arc<Endpoint>> {
        if candidates.is_empty() {
            return Err(RotatorError::pool_unavailable("no candidates for random selection"));
        }

        let index = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates.endpoints()[index].clone())
    }

    fn record_result(&self, _endpoint: &Endpoint, _success: bool, _latency: Duration) {}
}
