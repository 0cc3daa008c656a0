use rand::Rng;

use crate::algorithms::{Selection, SelectionContext, SelectionStrategy};

/// Uniform choice from the balancer's seeded RNG.
#[derive(Default)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn select(&mut self, ctx: &mut SelectionContext) -> Selection {
        Selection {
            backend_id: ctx.rng.gen_range(0..ctx.backend_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::test_support::picks;

    #[test]
    fn random_is_reproducible_for_a_seed() {
        let first = picks(&mut RandomStrategy, 5, &[], "", 50);
        let second = picks(&mut RandomStrategy, 5, &[], "", 50);
        assert_eq!(first, second);
        assert!(first.iter().all(|id| *id < 5));
    }

    #[test]
    fn random_reaches_every_backend() {
        let assigned = picks(&mut RandomStrategy, 4, &[], "", 400);
        for backend in 0..4 {
            assert!(assigned.contains(&backend));
        }
    }
}
