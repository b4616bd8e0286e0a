mod basic_tests;
mod concurrent_tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Payload that counts how many times it has been dropped.
/// 记录自身被 drop 次数的负载。
#[derive(Debug)]
pub(crate) struct Tracked {
    pub(crate) value: usize,
    drops: Arc<AtomicUsize>,
}

impl Tracked {
    pub(crate) fn new(value: usize, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            value,
            drops: drops.clone(),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}
