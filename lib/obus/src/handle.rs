//! Handle allocation: random, non-zero, collision-checked 16-bit ids.
//!
//! Object handles and call handles share this one representation and
//! allocator (the open question of `uint16_t` vs
//! `obus_handle_t`) but are drawn from separate tables — an object and
//! an in-flight call may coincidentally share a numeric value without
//! violating the uniqueness invariant, which is scoped per
//! table, not across the whole endpoint.

use indexmap::IndexMap;
use rand::Rng;

/// A non-zero 16-bit id, unique within one table of one bus endpoint for
/// the lifetime of the entry it names.
pub type Handle = u16;

/// Newtype for an object's handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectHandle(pub Handle);

/// Newtype for a pending method call's handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CallHandle(pub Handle);

/// Draws a random non-zero handle not already present as a key in
/// `existing`, retrying on collision.
pub fn allocate<V>(existing: &IndexMap<Handle, V>) -> Handle {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: Handle = rng.gen();
        if candidate != 0 && !existing.contains_key(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_allocates_zero() {
        let table: IndexMap<Handle, ()> = IndexMap::new();
        for _ in 0..1000 {
            assert_ne!(allocate(&table), 0);
        }
    }

    #[test]
    fn avoids_existing_entries() {
        let mut table: IndexMap<Handle, ()> = IndexMap::new();
        for h in 1..=1000u16 {
            table.insert(h, ());
        }
        let handle = allocate(&table);
        assert!(handle == 0 || !table.contains_key(&handle) || handle > 1000);
        assert!(!table.contains_key(&handle));
    }
}
