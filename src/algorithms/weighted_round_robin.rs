use crate::algorithms::{Selection, SelectionContext, SelectionStrategy};

/// Cycles through a schedule built once at construction in which every
/// backend appears as many times as it has workers. Entries are interleaved
/// (smooth weighted round-robin) so heavy backends are not hit in long runs.
pub struct WeightedRoundRobinStrategy {
    cursor: usize,
    schedule: Vec<usize>,
}

impl WeightedRoundRobinStrategy {
    pub fn new(weights: &[u32]) -> Self {
        Self {
            cursor: 0,
            schedule: build_schedule(weights),
        }
    }

    pub fn schedule(&self) -> &[usize] {
        &self.schedule
    }
}

fn build_schedule(weights: &[u32]) -> Vec<usize> {
    let total: i64 = weights.iter().map(|weight| *weight as i64).sum();
    let mut current = vec![0i64; weights.len()];
    let mut schedule = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let mut best = 0;
        for (idx, weight) in weights.iter().enumerate() {
            current[idx] += *weight as i64;
            if current[idx] > current[best] {
                best = idx;
            }
        }
        current[best] -= total;
        schedule.push(best);
    }

    schedule
}

impl SelectionStrategy for WeightedRoundRobinStrategy {
    fn select(&mut self, ctx: &mut SelectionContext) -> Selection {
        if self.schedule.is_empty() {
            let idx = self.cursor % ctx.backend_count;
            self.cursor = (idx + 1) % ctx.backend_count;
            return Selection { backend_id: idx };
        }

        let idx = self.schedule[self.cursor];
        self.cursor = (self.cursor + 1) % self.schedule.len();
        Selection { backend_id: idx }
    }
}
