//! Partitioning helpers shared by the parallel stages.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::AddAssign;

/// Chunk length that splits `total` rows into at most `shard_count` shards.
///
/// Never returns zero, so it is always a valid `par_chunks` argument.
pub(crate) fn shard_len(total: usize, shard_count: usize) -> usize {
    let shards = shard_count.max(1);
    total.div_ceil(shards).max(1)
}

/// Folds shard-local partial reductions into one map, merging partials of a
/// key that was split across shards instead of keeping them side by side.
pub(crate) fn merge_partials<K, V, I>(partials: I) -> HashMap<K, V>
where
    K: Eq + Hash,
    V: AddAssign + Default,
    I: IntoIterator<Item = HashMap<K, V>>,
{
    let mut merged: HashMap<K, V> = HashMap::new();
    for partial in partials {
        for (key, value) in partial {
            *merged.entry(key).or_default() += value;
        }
    }
    merged
}
