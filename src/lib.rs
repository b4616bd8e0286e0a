//! Reference-counted nodes behind lock-free links, with deferred batched
//! reclamation.
//!
//! A [`Link`] is a shared slot pointing at a node. Readers
//! [`dereference`](ReclaimDomain::dereference) it to take a *pin* (a count
//! increment); writers replace its target with
//! [`store_into`](ReclaimDomain::store_into) or
//! [`compare_and_swap`](ReclaimDomain::compare_and_swap), which moves the
//! link's *anchor* from the old node to the new one. When a node's count
//! drops to zero, the single releaser that holds its retirement gate queues it
//! in the domain's deferred-free buffer, and [`sweep`](ReclaimDomain::sweep)
//! frees queued nodes in batches.
//!
//! No lock is taken on the read or write path: only atomic loads, stores,
//! increments and compare-and-swaps. A releaser blocks only while the
//! deferred-free buffer is full. A sweep locks the list of nodes waiting to
//! be freed, and waits for in-flight reads to finish once that list is as
//! large as the buffer.
//!
//! [`Pinned`] wraps a pin in a guard so that the protocol can be used without
//! `unsafe`. [`SnapshotMap`] is an ordered byte map built on a single link.
//!
//! 基于无锁链接的引用计数节点，以及延迟的批量回收。
//! 读者 `dereference` 链接以获取一个 pin（计数加一）；写者通过 `store_into` 或
//! `compare_and_swap` 替换链接目标，把链接的锚从旧节点移到新节点。当节点计数降到零时，
//! 持有其退休门闩的唯一释放者将其放入域的延迟释放缓冲区，`sweep` 批量释放这些节点。
//!
//! ```
//! use refcnt_link::{Link, ReclaimDomain};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let freed = Arc::new(AtomicUsize::new(0));
//! let counter = freed.clone();
//! let domain = ReclaimDomain::builder()
//!     .retirement_threshold(4)
//!     .on_free(move |_payload: u64| {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     })
//!     .build();
//!
//! let link = Link::new();
//! for value in 0..10u64 {
//!     let node = domain.insert(value);
//!     domain.store(&link, Some(&node));
//! }
//! assert_eq!(*domain.pin(&link).unwrap(), 9);
//!
//! domain.store(&link, None);
//! drop(domain);
//! assert_eq!(freed.load(Ordering::Relaxed), 10);
//! ```

mod domain;
mod error;
mod garbage;
mod ptr;
mod reader;
mod snapshot_map;
mod state;
mod store;
mod sync;

pub use domain::{FreeCallback, ReclaimDomain, ReclaimDomainBuilder, TerminateCallback};
pub use error::{CasError, StoreError};
pub use ptr::{Link, MarkedPtr, NodePtr};
pub use reader::Pinned;
pub use snapshot_map::{SnapshotMap, SnapshotMapBuilder};
pub use store::{AddOutcome, Comparator, KeyedStore, ValueReleaseCallback, WalkAction};

#[cfg(test)]
mod tests;
