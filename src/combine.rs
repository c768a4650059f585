//! Per-key combination.
//!
//! [`CombineFn`] is the mergeable-accumulator contract both engines run on:
//! batch workers build one accumulator per key per partition and merge them
//! during reduce, stream workers keep one live accumulator per key. The
//! contract requires `merge` to agree with repeated `add_input`, so a
//! combiner can double as its own reducer.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::take;
use std::ops::Add;

/// A commutative, mergeable aggregation over per-key values.
///
/// `V` is the input value, `A` the accumulator, `O` the extracted output.
pub trait CombineFn<V, A, O>: Send + Sync {
    fn create(&self) -> A;
    fn add_input(&self, acc: &mut A, v: V);
    fn merge(&self, acc: &mut A, other: A);
    fn finish(&self, acc: A) -> O;
}

/// Sum of values per key.
///
/// - Accumulator: `T`
/// - Output: `T`
///
/// Requires `T: Add<Output=T> + Default`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sum<T>(pub PhantomData<T>);

impl<T> Sum<T> {
    /// Convenience constructor (same as `Default`).
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> CombineFn<T, T, T> for Sum<T>
where
    T: Add<Output = T> + Default + Send + Sync,
{
    fn create(&self) -> T {
        T::default()
    }

    fn add_input(&self, acc: &mut T, v: T) {
        *acc = take(acc) + v;
    }

    fn merge(&self, acc: &mut T, other: T) {
        *acc = take(acc) + other;
    }

    fn finish(&self, acc: T) -> T {
        acc
    }
}

/// Route a key to one of `partitions` slots.
///
/// Deterministic across processes (the hasher is seeded with constants), so
/// a key lands on the same partition every run. `partitions` of zero is
/// treated as one.
pub fn key_partition(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}
