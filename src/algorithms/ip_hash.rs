use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::algorithms::{Selection, SelectionContext, SelectionStrategy};

/// Maps a client key onto `hash(key) mod backend_count`.
///
/// Mappings are stable only while the backend set is unchanged; adding or
/// removing a backend remaps most keys.
#[derive(Default)]
pub struct IpHashStrategy;

pub fn hash_key(client_key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    client_key.hash(&mut hasher);
    hasher.finish()
}

impl SelectionStrategy for IpHashStrategy {
    fn select(&mut self, ctx: &mut SelectionContext) -> Selection {
        let idx = (hash_key(ctx.client_key) % ctx.backend_count as u64) as usize;
        Selection { backend_id: idx }
    }
}
