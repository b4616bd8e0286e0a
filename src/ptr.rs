use crate::state::{REMOVED_MARK, RefNode};
use crate::sync::{AtomicPtr, AtomicUsize, Ordering};
use std::fmt;
use std::ptr::{self, NonNull};

/// A raw handle to a reference-counted node.
///
/// `NodePtr<T>` is `Copy` and carries no ownership by itself: it is the
/// currency of the link protocol. Whoever obtained it from
/// [`ReclaimDomain::new_node`], [`ReclaimDomain::dereference`] or
/// [`ReclaimDomain::retain`] owns exactly one pin on the node and must give it
/// back with [`ReclaimDomain::release`].
///
/// Reading through the handle is `unsafe` because the type system cannot see
/// the pin. Use [`Pinned`] for the checked version.
///
/// 指向引用计数节点的原始句柄。
/// `NodePtr<T>` 是 `Copy` 的，本身不携带所有权：它是链接协议的流通货币。
/// 通过 `new_node`、`dereference` 或 `retain` 获得它的人恰好拥有该节点的一个 pin，
/// 并且必须通过 `release` 归还。
///
/// [`ReclaimDomain::new_node`]: crate::ReclaimDomain::new_node
/// [`ReclaimDomain::dereference`]: crate::ReclaimDomain::dereference
/// [`ReclaimDomain::retain`]: crate::ReclaimDomain::retain
/// [`ReclaimDomain::release`]: crate::ReclaimDomain::release
/// [`Pinned`]: crate::Pinned
pub struct NodePtr<T> {
    ptr: NonNull<RefNode<T>>,
}

impl<T> NodePtr<T> {
    #[inline]
    pub(crate) fn from_box(node: Box<RefNode<T>>) -> Self {
        Self {
            ptr: NonNull::from(Box::leak(node)),
        }
    }

    #[inline]
    pub(crate) fn from_raw(raw: *mut RefNode<T>) -> Option<Self> {
        NonNull::new(raw).map(|ptr| Self { ptr })
    }

    #[inline]
    pub(crate) fn as_raw(self) -> *mut RefNode<T> {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// The node must not have been freed.
    #[inline]
    pub(crate) unsafe fn node<'a>(self) -> &'a RefNode<T> {
        unsafe { self.ptr.as_ref() }
    }

    /// Takes the node storage back for freeing.
    ///
    /// # Safety
    /// The node must be retired and unreachable, and this must be called once.
    #[inline]
    pub(crate) unsafe fn into_box(self) -> Box<RefNode<T>> {
        unsafe { Box::from_raw(self.ptr.as_ptr()) }
    }

    /// Borrow the payload.
    ///
    /// # Safety
    /// The caller must hold a pin (or anchor) on the node for the whole of `'a`.
    #[inline]
    pub unsafe fn payload<'a>(self) -> &'a T {
        unsafe { &self.node().payload }
    }

    /// Current use count. Diagnostic only: the value may be stale by the time
    /// it is returned.
    ///
    /// # Safety
    /// The node must not have been freed.
    #[inline]
    pub unsafe fn ref_count(self) -> usize {
        unsafe { self.node().count.load(Ordering::Acquire) }
    }

    /// Whether the node has been retired (gate held with a count of zero).
    ///
    /// # Safety
    /// The node must not have been freed.
    #[inline]
    pub unsafe fn is_retired(self) -> bool {
        let node = unsafe { self.node() };
        node.retire_gate.load(Ordering::Acquire) && node.count.load(Ordering::Acquire) == 0
    }
}

impl<T> Clone for NodePtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodePtr<T> {}

impl<T> PartialEq for NodePtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for NodePtr<T> {}

impl<T> fmt::Debug for NodePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodePtr").field(&self.ptr).finish()
    }
}

// SAFETY: a handle only gives shared access to `T` and moves it to the
// domain's free callback, which may run on any thread.
unsafe impl<T: Send + Sync> Send for NodePtr<T> {}
unsafe impl<T: Send + Sync> Sync for NodePtr<T> {}

/// The word stored in a [`Link`]: a node pointer (or null) plus the
/// "logically removed" mark in its lowest bit.
///
/// 存储在 [`Link`] 中的字：节点指针（或空）加上最低位的"逻辑删除"标记。
pub struct MarkedPtr<T> {
    raw: *mut RefNode<T>,
}

impl<T> MarkedPtr<T> {
    /// The unmarked null word.
    #[inline]
    pub fn null() -> Self {
        Self {
            raw: ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn from_raw(raw: *mut RefNode<T>) -> Self {
        Self { raw }
    }

    #[inline]
    pub(crate) fn as_raw(self) -> *mut RefNode<T> {
        self.raw
    }

    #[inline]
    fn address(self) -> *mut RefNode<T> {
        self.raw.map_addr(|addr| addr & !REMOVED_MARK)
    }

    /// `true` when no node is referenced, whatever the mark.
    #[inline]
    pub fn is_null(self) -> bool {
        self.address().is_null()
    }

    #[inline]
    pub fn is_marked(self) -> bool {
        self.raw.addr() & REMOVED_MARK != 0
    }

    /// The same word with the mark set or cleared.
    #[inline]
    pub fn with_mark(self, mark: bool) -> Self {
        let raw = if mark {
            self.raw.map_addr(|addr| addr | REMOVED_MARK)
        } else {
            self.address()
        };
        Self { raw }
    }

    /// The referenced node with the mark stripped.
    #[inline]
    pub fn node(self) -> Option<NodePtr<T>> {
        NodePtr::from_raw(self.address())
    }
}

impl<T> From<NodePtr<T>> for MarkedPtr<T> {
    #[inline]
    fn from(node: NodePtr<T>) -> Self {
        Self { raw: node.as_raw() }
    }
}

impl<T> From<Option<NodePtr<T>>> for MarkedPtr<T> {
    #[inline]
    fn from(node: Option<NodePtr<T>>) -> Self {
        node.map_or_else(Self::null, Self::from)
    }
}

impl<T> Clone for MarkedPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MarkedPtr<T> {}

impl<T> PartialEq for MarkedPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for MarkedPtr<T> {}

impl<T> Default for MarkedPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for MarkedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkedPtr")
            .field("ptr", &self.address())
            .field("marked", &self.is_marked())
            .finish()
    }
}

unsafe impl<T: Send + Sync> Send for MarkedPtr<T> {}
unsafe impl<T: Send + Sync> Sync for MarkedPtr<T> {}

/// A shared slot pointing at a reference-counted node.
///
/// A link is owned by an external structure (a list cell, a tree child
/// pointer, the root of a map). While it points at a node it holds one
/// *anchor* on it; the anchor is moved by
/// [`ReclaimDomain::store_into`] and [`ReclaimDomain::compare_and_swap`].
///
/// Dropping a link does **not** release its anchor: clear it with
/// `store_into(&link, None)` first, otherwise the node is leaked.
///
/// The first store binds the link to that domain. Pinning or storing through
/// any other domain panics, since its nodes are freed by their own domain.
///
/// 指向引用计数节点的共享槽。
/// 链接由外部结构持有（链表单元、树的子指针、映射的根）。当它指向一个节点时，
/// 它持有该节点的一个*锚*；锚由 `store_into` 和 `compare_and_swap` 移动。
/// drop 链接**不会**释放它的锚：请先用 `store_into(&link, None)` 清空，否则节点会泄漏。
/// 首次存储将链接绑定到该域；通过其他域 pin 或存储会 panic。
///
/// [`ReclaimDomain::store_into`]: crate::ReclaimDomain::store_into
/// [`ReclaimDomain::compare_and_swap`]: crate::ReclaimDomain::compare_and_swap
pub struct Link<T> {
    ptr: AtomicPtr<RefNode<T>>,
    /// Id of the domain the link's nodes belong to, `0` until the first store.
    owner: AtomicUsize,
}

impl<T> Link<T> {
    /// An empty, unmarked link.
    #[inline]
    pub fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicUsize::new(0),
        }
    }

    /// Raw view of the current word. Takes no pin; the node behind it may be
    /// retired at any moment.
    #[inline]
    pub fn load(&self) -> MarkedPtr<T> {
        MarkedPtr::from_raw(self.ptr.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.load().is_null()
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.load().is_marked()
    }

    /// Set the "logically removed" mark, provided the link still holds
    /// `expected` (unmarked). Counts are untouched: the anchor stays with the
    /// node until the link is overwritten.
    ///
    /// 设置"逻辑删除"标记，前提是链接仍持有未标记的 `expected`。不改变计数。
    pub fn mark(&self, expected: MarkedPtr<T>) -> bool {
        if expected.is_marked() {
            return false;
        }
        self.compare_exchange(expected, expected.with_mark(true))
            .is_ok()
    }

    /// Bind the link to `domain` on first use; panic if it already belongs to
    /// another one. Runs before the word is published, so a reader that sees
    /// a node also sees the owner.
    ///
    /// 首次使用时将链接绑定到 `domain`；若已属于其他域则 panic。
    #[inline]
    pub(crate) fn bind(&self, domain: usize) {
        if let Err(owner) =
            self.owner
                .compare_exchange(0, domain, Ordering::AcqRel, Ordering::Acquire)
        {
            assert_owner(owner, domain);
        }
    }

    /// Panic unless the link belongs to `domain`. Only meaningful once the
    /// link has held a node.
    #[inline]
    pub(crate) fn check_owner(&self, domain: usize) {
        assert_owner(self.owner.load(Ordering::Acquire), domain);
    }

    #[inline]
    pub(crate) fn swap(&self, new: MarkedPtr<T>) -> MarkedPtr<T> {
        MarkedPtr::from_raw(self.ptr.swap(new.as_raw(), Ordering::AcqRel))
    }

    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: MarkedPtr<T>,
        new: MarkedPtr<T>,
    ) -> Result<MarkedPtr<T>, MarkedPtr<T>> {
        self.ptr
            .compare_exchange(
                current.as_raw(),
                new.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(MarkedPtr::from_raw)
            .map_err(MarkedPtr::from_raw)
    }
}

#[inline]
fn assert_owner(owner: usize, domain: usize) {
    assert!(
        owner == domain,
        "BUG: Link used with a ReclaimDomain other than the one that stored into it. \
         Its nodes would be pinned and freed by the wrong domain."
    );
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Link").field(&self.load()).finish()
    }
}
