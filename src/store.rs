use crate::error::StoreError;
use std::cmp::Ordering;
use std::sync::Arc;

/// Orders two keys. The default is plain byte order.
/// 比较两个键。默认为字节序。
pub type Comparator = Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Told about a value when it is overwritten, deleted, or removed by a walk.
/// 在值被覆盖、被删除或被遍历删除时接收通知。
pub type ValueReleaseCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Outcome of [`KeyedStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The key was not present; a new entry holds the value.
    Created,
    /// The key was present; its value was replaced.
    Updated,
}

/// What a walk callback wants done after visiting an entry.
///
/// 遍历回调在访问一个条目之后希望执行的操作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Continue,
    Stop,
    /// Delete the visited entry, then go on.
    Remove,
    /// Delete the visited entry, then stop.
    RemoveAndStop,
}

impl WalkAction {
    #[inline]
    pub fn removes(self) -> bool {
        matches!(self, Self::Remove | Self::RemoveAndStop)
    }

    #[inline]
    pub fn stops(self) -> bool {
        matches!(self, Self::Stop | Self::RemoveAndStop)
    }
}

/// Contract of a keyed structure built on top of reference-counted links:
/// opaque byte keys and values, totally ordered by a comparator.
///
/// 构建在引用计数链接之上的键值结构的契约：不透明的字节键和值，由比较器全序排列。
pub trait KeyedStore {
    /// Insert `value` under `key`, replacing any previous value.
    fn add(&self, key: &[u8], value: &[u8]) -> AddOutcome;

    /// Remove `key`, handing its value back to the caller.
    ///
    /// The caller owns the returned value: the value-release callback is not
    /// fired for it. Use [`delete`](Self::delete) to discard the value through
    /// the callback instead.
    ///
    /// 删除 `key` 并把它的值交还调用者。返回的值归调用者所有，不会触发值释放回调；
    /// 若要通过回调丢弃值，请使用 `delete`。
    fn remove(&self, key: &[u8]) -> Result<Arc<[u8]>, StoreError>;

    /// Remove `key` and discard its value, firing the value-release callback.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    fn find(&self, key: &[u8]) -> Option<Arc<[u8]>>;

    /// Visit entries in no particular order. Returns the number visited.
    ///
    /// The callback runs with writers locked out. It must not call `add`,
    /// `remove`, `delete`, `walk` or `walk_sorted` on the same store, which
    /// would deadlock; return [`WalkAction::Remove`] to delete the visited
    /// entry instead. Lookups such as `find` and `len` are fine.
    ///
    /// 回调运行期间写者被挡在外面：回调中不得对同一存储调用 `add`、`remove`、`delete`、
    /// `walk` 或 `walk_sorted`，否则会死锁；要删除当前条目请返回 `WalkAction::Remove`。
    fn walk<F>(&self, callback: F) -> usize
    where
        F: FnMut(&[u8], &[u8]) -> WalkAction;

    /// Visit entries in ascending key order. Returns the number visited.
    ///
    /// Same locking rules as [`walk`](Self::walk).
    fn walk_sorted<F>(&self, callback: F) -> usize
    where
        F: FnMut(&[u8], &[u8]) -> WalkAction;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
