//! Collection aliases used across the engine.

pub use smallvec::{smallvec, SmallVec};

pub type DefaultHasher = foldhash::fast::RandomState;

pub mod hashmap {
    pub use hashbrown::hash_map::Entry;

    pub type HashMap<K, V> = hashbrown::HashMap<K, V, super::DefaultHasher>;
}

pub mod hashset {
    pub type HashSet<T> = hashbrown::HashSet<T, super::DefaultHasher>;
}

pub use hashmap::HashMap;
pub use hashset::HashSet;
