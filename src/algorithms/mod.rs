mod ip_hash;
mod least_connections;
mod random;
mod round_robin;
mod weighted_round_robin;

use rand::RngCore;

use crate::models::AlgoConfig;

pub use ip_hash::IpHashStrategy;
pub use least_connections::LeastConnectionsStrategy;
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use weighted_round_robin::WeightedRoundRobinStrategy;

pub trait SelectionStrategy: Send {
    fn select(&mut self, ctx: &mut SelectionContext) -> Selection;

    /// Whether `select` reads `SelectionContext::loads`. Callers skip
    /// sampling backend queues for strategies that ignore them.
    fn needs_loads(&self) -> bool {
        false
    }
}

pub struct SelectionContext<'a> {
    pub backend_count: usize,
    /// Queue depth per backend, in backend order. Empty unless the strategy
    /// asked for loads.
    pub loads: &'a [u32],
    pub client_key: &'a str,
    pub rng: &'a mut dyn RngCore,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Selection {
    pub backend_id: usize,
}

/// `weights` holds each backend's worker count, in backend order.
pub fn build_strategy(algo: AlgoConfig, weights: &[u32]) -> Box<dyn SelectionStrategy> {
    match algo {
        AlgoConfig::RoundRobin => Box::new(RoundRobinStrategy::default()),
        AlgoConfig::LeastConnections => Box::new(LeastConnectionsStrategy),
        AlgoConfig::Random => Box::new(RandomStrategy),
        AlgoConfig::WeightedRoundRobin => Box::new(WeightedRoundRobinStrategy::new(weights)),
        AlgoConfig::IpHash => Box::new(IpHashStrategy),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::{SelectionContext, SelectionStrategy};

    pub fn picks(
        strategy: &mut dyn SelectionStrategy,
        backend_count: usize,
        loads: &[u32],
        client_key: &str,
        rounds: usize,
    ) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = SelectionContext {
            backend_count,
            loads,
            client_key,
            rng: &mut rng,
        };
        (0..rounds)
            .map(|_| strategy.select(&mut ctx).backend_id)
            .collect()
    }
}
