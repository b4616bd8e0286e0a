use crate::domain::{ReclaimDomain, add_anchor};
use crate::error::CasError;
use crate::ptr::{Link, MarkedPtr, NodePtr};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr;

/// A pin on a node, released when the guard is dropped.
///
/// `Pinned` is the checked face of the link protocol: as long as the guard
/// exists the node cannot be retired, so the payload can be borrowed through
/// `Deref`. Cloning takes another pin; dropping gives one back (and may
/// retire the node, and may run a bounded sweep).
///
/// Its lifetime is bound to the [`ReclaimDomain`] that manages the node.
///
/// 节点上的一个 pin，在守卫被 drop 时释放。
/// `Pinned` 是链接协议的受检接口：只要守卫存在，节点就不会退休，因此可以通过 `Deref` 借用负载。
/// 克隆会获取另一个 pin；drop 会归还一个（可能使节点退休，也可能触发有界清扫）。
/// 它的生命周期被绑定到管理该节点的 `ReclaimDomain`。
#[must_use]
pub struct Pinned<'d, T> {
    domain: &'d ReclaimDomain<T>,
    node: NodePtr<T>,
}

impl<'d, T> Pinned<'d, T> {
    /// Adopt a raw pin.
    ///
    /// # Safety
    /// The caller must own one pin on `node`, and `node` must belong to `domain`.
    #[inline]
    pub unsafe fn from_raw(domain: &'d ReclaimDomain<T>, node: NodePtr<T>) -> Self {
        Self { domain, node }
    }

    /// Hand the pin back to the caller as a raw handle; it is no longer
    /// released automatically.
    #[inline]
    pub fn into_raw(self) -> NodePtr<T> {
        let this = ManuallyDrop::new(self);
        this.node
    }

    /// The handle this guard pins. The pin stays with the guard.
    #[inline]
    pub fn as_ptr(&self) -> NodePtr<T> {
        self.node
    }

    #[inline]
    pub fn domain(&self) -> &'d ReclaimDomain<T> {
        self.domain
    }

    /// Current use count of the pinned node (diagnostic).
    #[inline]
    pub fn ref_count(&self) -> usize {
        unsafe { self.node.ref_count() }
    }
}

impl<T> Deref for Pinned<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard owns a pin, so the node is live.
        unsafe { self.node.payload() }
    }
}

impl<T> Clone for Pinned<'_, T> {
    /// Take another pin on the same node.
    /// 在同一节点上再获取一个 pin。
    #[inline]
    fn clone(&self) -> Self {
        // SAFETY: our own pin keeps the count above zero.
        unsafe { add_anchor(self.node) };
        Self {
            domain: self.domain,
            node: self.node,
        }
    }
}

impl<T> Drop for Pinned<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the guard owns exactly one pin.
        unsafe { self.domain.release(self.node) };
    }
}

impl<T: fmt::Debug> fmt::Debug for Pinned<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pinned")
            .field("node", &self.node)
            .field("payload", &**self)
            .finish()
    }
}

impl<T> ReclaimDomain<T> {
    /// Allocate a node and return its creation pin as a guard.
    ///
    /// 分配一个节点，并以守卫的形式返回其创建 pin。
    #[inline]
    pub fn insert(&self, payload: T) -> Pinned<'_, T> {
        Pinned {
            domain: self,
            node: self.new_node(payload),
        }
    }

    /// Pin the target of `link`, treating a marked link as empty.
    /// pin 住 `link` 的目标，被标记的链接视为空。
    ///
    /// # Panics
    /// If `link` holds a node of another domain.
    #[inline]
    pub fn pin(&self, link: &Link<T>) -> Option<Pinned<'_, T>> {
        self.dereference_skipping_removed(link)
            .map(|node| Pinned { domain: self, node })
    }

    /// Pin the target of `link`, following the removal mark.
    #[inline]
    pub fn pin_allowing_removed(&self, link: &Link<T>) -> Option<Pinned<'_, T>> {
        self.dereference_allowing_removed(link)
            .map(|node| Pinned { domain: self, node })
    }

    /// Safe [`store_into`](Self::store_into): the guard proves the pin on the
    /// new target.
    ///
    /// # Panics
    /// If `new` belongs to another domain, or `link` is bound to one.
    pub fn store(&self, link: &Link<T>, new: Option<&Pinned<'_, T>>) {
        let new = new.map(|pinned| self.adopt(pinned));
        // SAFETY: `new` is pinned by the borrowed guard.
        unsafe { self.store_into(link, new) }
    }

    /// Safe [`compare_and_swap`](Self::compare_and_swap).
    ///
    /// # Panics
    /// If `new` belongs to another domain, or `link` is bound to one.
    pub fn compare_exchange(
        &self,
        link: &Link<T>,
        expected: MarkedPtr<T>,
        new: Option<&Pinned<'_, T>>,
    ) -> Result<MarkedPtr<T>, CasError<T>> {
        let new = new.map(|pinned| self.adopt(pinned));
        // SAFETY: `new` is pinned by the borrowed guard.
        unsafe { self.compare_and_swap(link, expected, new) }
    }

    fn adopt(&self, pinned: &Pinned<'_, T>) -> NodePtr<T> {
        assert!(
            ptr::eq(pinned.domain, self),
            "BUG: publishing a node pinned in another ReclaimDomain. \
             Its retirement would be queued in the wrong domain."
        );
        pinned.node
    }
}
