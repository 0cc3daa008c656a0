use crate::algorithms::{Selection, SelectionContext, SelectionStrategy};

#[derive(Default)]
pub struct RoundRobinStrategy {
    next_idx: usize,
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select(&mut self, ctx: &mut SelectionContext) -> Selection {
        let idx = self.next_idx % ctx.backend_count;
        self.next_idx = (idx + 1) % ctx.backend_count;
        Selection { backend_id: idx }
    }
}
