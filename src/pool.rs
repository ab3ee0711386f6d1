//! `Pool<T>` — an ordered collection keyed by insertion counter with
//! uniform-random selection. Used for peer sets, pause-time pools, and
//! (transitively, via the Markov model) per-stream PRNGs. Backed by
//! `indexmap::IndexMap`, which gives O(1) random access by index while
//! preserving insertion order.

use indexmap::IndexMap;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct Pool<T> {
    items: IndexMap<u64, T>,
    next_id: u64,
}

impl<T> Pool<T> {
    pub fn new() -> Pool<T> {
        Pool { items: IndexMap::new(), next_id: 0 }
    }

    pub fn insert(&mut self, item: T) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.items.insert(id, item);
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        self.items.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Uniform random selection over the current contents. `None` iff the
    /// pool is empty.
    pub fn random(&self, rng: &mut impl Rng) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..self.items.len());
        self.items.get_index(idx).map(|(_, v)| v)
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Pool<T> {
        Pool::new()
    }
}

impl<T> FromIterator<T> for Pool<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Pool<T> {
        let mut pool = Pool::new();
        for item in iter {
            pool.insert(item);
        }
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn random_selection_over_large_sample_hits_every_item() {
        let pool: Pool<u32> = (0..4).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            seen.insert(*pool.random(&mut rng).unwrap());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn empty_pool_yields_none() {
        let pool: Pool<u32> = Pool::new();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(pool.random(&mut rng).is_none());
    }
}
