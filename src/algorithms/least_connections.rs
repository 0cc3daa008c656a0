use crate::algorithms::{Selection, SelectionContext, SelectionStrategy};

/// Picks the backend with the shallowest queue. Ties go to the backend that
/// appears first in the list.
#[derive(Default)]
pub struct LeastConnectionsStrategy;

impl SelectionStrategy for LeastConnectionsStrategy {
    fn select(&mut self, ctx: &mut SelectionContext) -> Selection {
        let mut best = 0;
        let mut min_depth = u32::MAX;

        for idx in 0..ctx.backend_count {
            let depth = ctx.loads.get(idx).copied().unwrap_or(0);
            if depth < min_depth {
                min_depth = depth;
                best = idx;
            }
        }

        Selection { backend_id: best }
    }

    fn needs_loads(&self) -> bool {
        true
    }
}
