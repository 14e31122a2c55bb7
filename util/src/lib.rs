use std::collections::{HashMap, HashSet};

pub mod serde_helpers;
pub mod tl;

#[cfg(feature = "test")]
pub mod test;

pub type FastHashMap<K, V> = HashMap<K, V, ahash::RandomState>;
pub type FastHashSet<K> = HashSet<K, ahash::RandomState>;
