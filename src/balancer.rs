use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::algorithms::{build_strategy, SelectionContext, SelectionStrategy};
use crate::error::{Error, Result};
use crate::models::AlgoConfig;

struct BalancerState {
    strategy: Box<dyn SelectionStrategy>,
    rng: StdRng,
}

/// Chooses a backend index per request.
///
/// The balancer owns only its selection state. Callers sample backend queue
/// depths before calling [`LoadBalancer::select`], so the balancer lock is
/// never held while a backend lock is taken.
pub struct LoadBalancer {
    algorithm: AlgoConfig,
    backend_count: usize,
    needs_loads: bool,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    /// `weights` holds each backend's worker count, in routing order.
    pub fn new(algorithm: AlgoConfig, weights: &[u32], seed: u64) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::EmptyBackends);
        }
        let strategy = build_strategy(algorithm, weights);
        let needs_loads = strategy.needs_loads();

        Ok(Self {
            algorithm,
            backend_count: weights.len(),
            needs_loads,
            state: Mutex::new(BalancerState {
                strategy,
                rng: StdRng::seed_from_u64(seed),
            }),
        })
    }

    pub fn algorithm(&self) -> AlgoConfig {
        self.algorithm
    }

    pub fn needs_loads(&self) -> bool {
        self.needs_loads
    }

    /// `loads` must hold one queue depth per backend when
    /// [`needs_loads`](Self::needs_loads) is true; it is ignored otherwise.
    pub fn select(&self, client_key: &str, loads: &[u32]) -> usize {
        let mut state = self.state.lock();
        let BalancerState { strategy, rng } = &mut *state;
        let mut ctx = SelectionContext {
            backend_count: self.backend_count,
            loads,
            client_key,
            rng,
        };
        strategy.select(&mut ctx).backend_id
    }
}
