use crate::domain::ReclaimDomain;
use crate::error::StoreError;
use crate::ptr::Link;
use crate::reader::Pinned;
use crate::state::DEFAULT_RETIREMENT_THRESHOLD;
use crate::store::{AddOutcome, Comparator, KeyedStore, ValueReleaseCallback, WalkAction};
use crate::sync::Mutex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct Entry {
    key: Arc<[u8]>,
    value: Arc<[u8]>,
}

/// Immutable, sorted by the map's comparator.
pub(crate) type Snapshot = Vec<Entry>;

/// Builder for configuring a [`SnapshotMap`].
///
/// # Example
/// ```
/// use refcnt_link::{KeyedStore, SnapshotMap};
///
/// // Longest key first.
/// let map = SnapshotMap::builder()
///     .comparator(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)))
///     .build();
/// map.add(b"a", b"1");
/// map.add(b"abc", b"3");
///
/// let mut keys = Vec::new();
/// map.walk_sorted(|key, _| {
///     keys.push(key.to_vec());
///     refcnt_link::WalkAction::Continue
/// });
/// assert_eq!(keys, vec![b"abc".to_vec(), b"a".to_vec()]);
/// ```
pub struct SnapshotMapBuilder {
    comparator: Option<Comparator>,
    on_value_release: Option<ValueReleaseCallback>,
    retirement_threshold: usize,
}

impl SnapshotMapBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            comparator: None,
            on_value_release: None,
            retirement_threshold: DEFAULT_RETIREMENT_THRESHOLD,
        }
    }

    /// Key order. Default: byte order.
    #[inline]
    pub fn comparator(
        mut self,
        comparator: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.comparator = Some(Box::new(comparator));
        self
    }

    /// Called with the old value when it is overwritten by `add`, discarded
    /// by `delete` or removed by a walk. `remove` returns the value instead.
    #[inline]
    pub fn on_value_release(mut self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_value_release = Some(Box::new(callback));
        self
    }

    /// Retirement threshold of the map's reclamation domain.
    #[inline]
    pub fn retirement_threshold(mut self, threshold: usize) -> Self {
        self.retirement_threshold = threshold;
        self
    }

    pub fn build(self) -> SnapshotMap {
        SnapshotMap {
            root: Link::new(),
            domain: ReclaimDomain::with_threshold(self.retirement_threshold),
            writer: Mutex::new(()),
            comparator: self
                .comparator
                .unwrap_or_else(|| Box::new(|a: &[u8], b: &[u8]| a.cmp(b))),
            on_value_release: self.on_value_release,
        }
    }
}

impl Default for SnapshotMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An ordered byte map whose contents live behind a single [`Link`].
///
/// Readers pin the current snapshot without taking any lock. Writers are
/// serialized by a mutex, copy the snapshot, apply their change and publish
/// the copy with `store_into`; the replaced snapshot is retired through the
/// map's [`ReclaimDomain`] once the last reader unpins it.
///
/// Suited to read-mostly tables: a write costs a copy of the whole table.
///
/// 一个有序的字节映射，其内容位于单个 `Link` 之后。
/// 读者无需任何锁即可 pin 住当前快照。写者由互斥锁串行化，复制快照、应用修改并通过
/// `store_into` 发布副本；被替换的快照在最后一个读者解除 pin 后通过映射的 `ReclaimDomain` 退休。
///
/// # Example
/// ```
/// use refcnt_link::{AddOutcome, KeyedStore, SnapshotMap};
///
/// let map = SnapshotMap::new();
/// assert_eq!(map.add(b"k", b"v1"), AddOutcome::Created);
/// assert_eq!(map.add(b"k", b"v2"), AddOutcome::Updated);
/// assert_eq!(map.find(b"k").as_deref(), Some(&b"v2"[..]));
/// assert_eq!(&*map.remove(b"k").unwrap(), b"v2");
/// assert!(map.find(b"k").is_none());
/// ```
pub struct SnapshotMap {
    pub(crate) root: Link<Snapshot>,
    pub(crate) domain: ReclaimDomain<Snapshot>,
    writer: Mutex<()>,
    comparator: Comparator,
    on_value_release: Option<ValueReleaseCallback>,
}

impl SnapshotMap {
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[inline]
    pub fn builder() -> SnapshotMapBuilder {
        SnapshotMapBuilder::new()
    }

    fn search(&self, snapshot: &[Entry], key: &[u8]) -> Result<usize, usize> {
        snapshot.binary_search_by(|entry| (self.comparator)(&entry.key[..], key))
    }

    fn current(&self) -> Option<Pinned<'_, Snapshot>> {
        self.domain.pin(&self.root)
    }

    /// Publish `next` as the new root. Caller holds the writer lock.
    fn publish(&self, next: Snapshot) {
        let node = self.domain.insert(next);
        self.domain.store(&self.root, Some(&node));
    }

    fn release_values(&self, values: &[Arc<[u8]>]) {
        if let Some(on_value_release) = &self.on_value_release {
            for value in values {
                on_value_release(&value[..]);
            }
        }
    }

    fn walk_entries<F>(&self, mut callback: F) -> usize
    where
        F: FnMut(&[u8], &[u8]) -> WalkAction,
    {
        let _writer = self.writer.lock();
        let Some(current) = self.current() else {
            return 0;
        };

        let mut visited = 0;
        let mut doomed = vec![false; current.len()];
        let mut any_doomed = false;

        for (index, entry) in current.iter().enumerate() {
            visited += 1;
            let action = callback(&entry.key[..], &entry.value[..]);
            if action.removes() {
                doomed[index] = true;
                any_doomed = true;
            }
            if action.stops() {
                break;
            }
        }

        if any_doomed {
            let mut next = Snapshot::with_capacity(current.len());
            let mut released = Vec::new();
            for (entry, doomed) in current.iter().zip(doomed) {
                if doomed {
                    released.push(entry.value.clone());
                } else {
                    next.push(entry.clone());
                }
            }
            self.publish(next);
            drop(current);
            self.release_values(&released);
        }

        visited
    }
}

impl KeyedStore for SnapshotMap {
    fn add(&self, key: &[u8], value: &[u8]) -> AddOutcome {
        let _writer = self.writer.lock();
        let current = self.current();
        let mut next: Snapshot = current.as_deref().cloned().unwrap_or_default();

        let value: Arc<[u8]> = Arc::from(value);
        let (outcome, replaced) = match self.search(&next, key) {
            Ok(index) => {
                let old = std::mem::replace(&mut next[index].value, value);
                (AddOutcome::Updated, Some(old))
            }
            Err(index) => {
                next.insert(
                    index,
                    Entry {
                        key: Arc::from(key),
                        value,
                    },
                );
                (AddOutcome::Created, None)
            }
        };

        self.publish(next);
        drop(current);

        if let Some(old) = replaced {
            self.release_values(&[old]);
        }
        outcome
    }

    fn remove(&self, key: &[u8]) -> Result<Arc<[u8]>, StoreError> {
        let _writer = self.writer.lock();
        let current = self.current().ok_or(StoreError::NotFound)?;
        let index = self
            .search(&current, key)
            .map_err(|_| StoreError::NotFound)?;

        let mut next = Snapshot::clone(&current);
        let removed = next.remove(index);
        self.publish(next);

        Ok(removed.value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let value = self.remove(key)?;
        self.release_values(&[value]);
        Ok(())
    }

    fn find(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        let current = self.current()?;
        let index = self.search(&current, key).ok()?;
        Some(current[index].value.clone())
    }

    /// Storage order. Callers must not rely on it.
    ///
    /// Holds the writer lock for the whole walk, so requested deletions are
    /// applied atomically. Writing to the map from the callback deadlocks.
    fn walk<F>(&self, callback: F) -> usize
    where
        F: FnMut(&[u8], &[u8]) -> WalkAction,
    {
        self.walk_entries(callback)
    }

    fn walk_sorted<F>(&self, callback: F) -> usize
    where
        F: FnMut(&[u8], &[u8]) -> WalkAction,
    {
        // Snapshots are kept sorted, so storage order is key order.
        self.walk_entries(callback)
    }

    fn len(&self) -> usize {
        self.current().map_or(0, |current| current.len())
    }
}

impl Default for SnapshotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotMap")
            .field("len", &self.len())
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl Drop for SnapshotMap {
    fn drop(&mut self) {
        // Drop the root's anchor; the domain (dropped next) frees the snapshot.
        self.domain.store(&self.root, None);
    }
}
