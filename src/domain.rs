use crate::error::CasError;
use crate::garbage::{DeferredBuffer, InFlight};
use crate::ptr::{Link, MarkedPtr, NodePtr};
use crate::state::{DEFAULT_RETIREMENT_THRESHOLD, RefNode, buffer_capacity, clamp_threshold};
use crate::sync::{AtomicUsize, Mutex, Ordering};
use crossbeam_utils::Backoff;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic;
use std::vec::Vec;

/// Source of domain ids. `0` means "no domain" on a [`Link`].
static NEXT_DOMAIN_ID: atomic::AtomicUsize = atomic::AtomicUsize::new(1);

/// Invoked once per node at the instant it is retired, before it is queued.
/// 每个节点在退休瞬间（入队之前）调用一次。
pub type TerminateCallback<T> = Box<dyn Fn(NodePtr<T>) + Send + Sync>;

/// Invoked once per node during the sweep, receiving the payload by value.
/// 每个节点在清扫期间调用一次，按值接收负载。
pub type FreeCallback<T> = Box<dyn Fn(T) + Send + Sync>;

/// Builder for configuring a [`ReclaimDomain`].
///
/// - `retirement_threshold`: backlog of retired nodes that triggers a sweep
/// - `on_terminate`: hook fired when a node dies
/// - `on_free`: hook receiving each payload when its node is freed
///
/// # Example
/// ```
/// use refcnt_link::ReclaimDomain;
///
/// let domain = ReclaimDomain::<String>::builder()
///     .retirement_threshold(128)
///     .on_free(|payload| drop(payload))
///     .build();
/// assert_eq!(domain.retirement_threshold(), 128);
/// ```
///
/// 用于配置 `ReclaimDomain` 的构建器。
pub struct ReclaimDomainBuilder<T> {
    retirement_threshold: usize,
    on_terminate: Option<TerminateCallback<T>>,
    on_free: Option<FreeCallback<T>>,
}

impl<T> ReclaimDomainBuilder<T> {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            retirement_threshold: DEFAULT_RETIREMENT_THRESHOLD,
            on_terminate: None,
            on_free: None,
        }
    }

    /// Set the retirement threshold.
    ///
    /// When more than `threshold` retired nodes wait in the buffer, the
    /// releaser that noticed it sweeps the backlog down to `threshold / 2`.
    /// The buffer holds `max(1.5 × threshold, 256)` entries and is allocated
    /// when the domain is built, so thresholds above `65536` are clamped to it.
    ///
    /// Default: `64`
    ///
    /// 设置退休阈值。
    /// 当缓冲区中等待的已退休节点超过 `threshold` 时，发现这一点的释放者会把积压清扫到 `threshold / 2`。
    /// 缓冲区在构建域时分配，因此超过 `65536` 的阈值会被截断。
    #[inline]
    pub fn retirement_threshold(mut self, threshold: usize) -> Self {
        self.retirement_threshold = threshold;
        self
    }

    /// Hook fired exactly once per node at logical death.
    ///
    /// It must not block and must not release the node it is given.
    ///
    /// 在逻辑死亡时每个节点恰好触发一次的钩子。不得阻塞，也不得释放传入的节点。
    #[inline]
    pub fn on_terminate(mut self, callback: impl Fn(NodePtr<T>) + Send + Sync + 'static) -> Self {
        self.on_terminate = Some(Box::new(callback));
        self
    }

    /// Hook receiving each payload when its node is freed. Without it the
    /// payload is simply dropped.
    ///
    /// 节点被释放时接收其负载的钩子。未设置时负载直接被 drop。
    #[inline]
    pub fn on_free(mut self, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_free = Some(Box::new(callback));
        self
    }

    /// Build the domain.
    /// 构建域。
    pub fn build(self) -> ReclaimDomain<T> {
        let retirement_threshold = clamp_threshold(self.retirement_threshold);
        ReclaimDomain {
            id: NEXT_DOMAIN_ID.fetch_add(1, atomic::Ordering::Relaxed),
            buffer: DeferredBuffer::with_capacity(buffer_capacity(retirement_threshold)),
            pending: Mutex::new(VecDeque::new()),
            in_flight: InFlight::new(),
            retirement_threshold,
            on_terminate: self.on_terminate,
            on_free: self.on_free,
        }
    }
}

impl<T> Default for ReclaimDomainBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reclamation domain for reference-counted nodes.
///
/// Every node created by [`new_node`](Self::new_node) is eventually freed
/// through the domain that created it. The domain implements the link access
/// protocol:
///
/// - readers [`dereference`](Self::dereference) a [`Link`] and get a pinned
///   [`NodePtr`], which they [`release`](Self::release) when done;
/// - writers replace a link's target with [`store_into`](Self::store_into) or
///   [`compare_and_swap`](Self::compare_and_swap), which moves the link's
///   anchor from the old node to the new one;
/// - the releaser that brings a node to zero under the retirement gate queues
///   it, and [`sweep`](Self::sweep) frees queued nodes in batches.
///
/// The raw protocol is `unsafe` where the caller must vouch for a pin. The
/// [`Pinned`](crate::Pinned) guard gives the same operations a checked surface.
///
/// Dropping the domain sweeps everything still queued. Nodes that are still
/// anchored by a link are not touched.
///
/// **Typical Usage**:
/// ```
/// use refcnt_link::{Link, ReclaimDomain};
///
/// let domain = ReclaimDomain::new();
/// let link = Link::new();
///
/// // Writer: publish a node, then drop the creation pin.
/// let node = domain.insert(String::from("hello"));
/// domain.store(&link, Some(&node));
/// drop(node);
///
/// // Reader: pin whatever the link points at.
/// let pinned = domain.pin(&link).unwrap();
/// assert_eq!(*pinned, "hello");
/// drop(pinned);
///
/// // Clear the link so the node can be retired.
/// domain.store(&link, None);
/// ```
///
/// 引用计数节点的回收域。
/// 由 `new_node` 创建的每个节点最终都通过创建它的域被释放。域实现了链接访问协议：
/// - 读者 `dereference` 一个 `Link`，得到一个被 pin 住的 `NodePtr`，用完后 `release`；
/// - 写者通过 `store_into` 或 `compare_and_swap` 替换链接目标，把链接的锚从旧节点移到新节点；
/// - 在退休门闩下把节点计数降到零的释放者将其入队，`sweep` 批量释放已入队节点。
/// drop 域时会清扫所有仍在队列中的节点。仍被链接锚定的节点不受影响。
pub struct ReclaimDomain<T> {
    id: usize,
    buffer: DeferredBuffer<T>,
    /// Nodes taken off the buffer, tagged with the epoch they were taken at,
    /// whose storage waits for that epoch to expire.
    pending: Mutex<VecDeque<(NodePtr<T>, usize)>>,
    pub(crate) in_flight: InFlight,
    retirement_threshold: usize,
    on_terminate: Option<TerminateCallback<T>>,
    on_free: Option<FreeCallback<T>>,
}

impl<T> ReclaimDomain<T> {
    /// Create a domain with the default threshold and no callbacks.
    /// 创建一个使用默认阈值且没有回调的域。
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a domain with the given retirement threshold and no callbacks.
    #[inline]
    pub fn with_threshold(threshold: usize) -> Self {
        Self::builder().retirement_threshold(threshold).build()
    }

    /// Create a builder for configuring the domain.
    /// 创建一个用于配置域的构建器。
    #[inline]
    pub fn builder() -> ReclaimDomainBuilder<T> {
        ReclaimDomainBuilder::new()
    }

    #[inline]
    pub fn retirement_threshold(&self) -> usize {
        self.retirement_threshold
    }

    /// Capacity of the deferred-free buffer.
    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Retired nodes queued in the buffer (`writes - reads`).
    #[inline]
    pub fn backlog(&self) -> usize {
        self.buffer.backlog()
    }

    /// Cumulative number of nodes ever queued for the sweep.
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.buffer.writes()
    }

    /// Cumulative number of nodes ever taken off the buffer by a sweep.
    #[inline]
    pub fn swept_count(&self) -> usize {
        self.buffer.reads()
    }

    /// Retired nodes whose storage has not been freed yet: the buffer backlog
    /// plus nodes swept while other threads were mid-operation.
    pub fn pending(&self) -> usize {
        self.backlog() + self.pending.lock().len()
    }

    // --- node construction ---

    /// Allocate a node with a count of one: the caller's own pin.
    ///
    /// 分配一个计数为一的节点：调用者自己的 pin。
    #[inline]
    pub fn new_node(&self, payload: T) -> NodePtr<T> {
        NodePtr::from_box(Box::new(RefNode::new(payload)))
    }

    /// Payload of `node`, `None` for a null handle.
    ///
    /// # Safety
    /// The caller must hold a pin on `node` for the whole of `'a`.
    #[inline]
    pub unsafe fn payload<'a>(&self, node: Option<NodePtr<T>>) -> Option<&'a T> {
        node.map(|node| unsafe { node.payload() })
    }

    /// Diagnostic read of a node's use count.
    ///
    /// # Safety
    /// `node` must not have been freed.
    #[inline]
    pub unsafe fn ref_count(&self, node: NodePtr<T>) -> usize {
        unsafe { node.ref_count() }
    }

    // --- read side ---

    /// Pin the node `link` currently points at.
    ///
    /// A marked link yields `None` when `skip_marked` is set; otherwise the
    /// mark is stripped and the node is pinned anyway. A node that is already
    /// retired is never pinned: if the link moved on meanwhile the new target
    /// is tried, if the link still holds the dead node (an anchor was released
    /// twice somewhere) the result is `None`.
    ///
    /// The returned handle carries one pin and must be given back with
    /// [`release`](Self::release).
    ///
    /// pin 住 `link` 当前指向的节点。
    /// 设置 `skip_marked` 时，被标记的链接返回 `None`；否则去掉标记后照常 pin。
    /// 已退休的节点永远不会被 pin：如果链接已经改变则尝试新目标，如果链接仍持有死节点
    /// （某处的锚被释放了两次）则返回 `None`。
    ///
    /// # Panics
    /// If `link` holds a node of another domain.
    pub fn dereference(&self, link: &Link<T>, skip_marked: bool) -> Option<NodePtr<T>> {
        let _op = self.in_flight.enter();
        let mut current = link.load();

        loop {
            if current.is_marked() && skip_marked {
                return None;
            }
            let node = current.node()?;
            link.check_owner(self.id);

            // SAFETY: the in-flight bracket keeps `node` allocated even if it
            // is retired between the load and this point.
            if unsafe { try_pin(node.node()) } {
                return Some(node);
            }

            let reloaded = link.load();
            if reloaded == current {
                #[cfg(feature = "tracing")]
                tracing::warn!(node = ?node, "link still anchors a retired node");
                return None;
            }
            current = reloaded;
        }
    }

    /// [`dereference`](Self::dereference) that treats a marked link as empty.
    #[inline]
    pub fn dereference_skipping_removed(&self, link: &Link<T>) -> Option<NodePtr<T>> {
        self.dereference(link, true)
    }

    /// [`dereference`](Self::dereference) that follows a marked link, for
    /// callers that must traverse a node in the middle of its removal.
    #[inline]
    pub fn dereference_allowing_removed(&self, link: &Link<T>) -> Option<NodePtr<T>> {
        self.dereference(link, false)
    }

    /// Take one more pin on a node the caller already pins.
    ///
    /// Returns `None` only if the node is already retired.
    ///
    /// # Safety
    /// `node` must not have been freed; holding a pin on it guarantees that.
    #[inline]
    pub unsafe fn retain(&self, node: NodePtr<T>) -> Option<NodePtr<T>> {
        if unsafe { try_pin(node.node()) } {
            Some(node)
        } else {
            None
        }
    }

    // --- release side ---

    /// Give back one pin (or anchor) on `node`.
    ///
    /// The count is decremented if positive, then the retirement gate is
    /// probed. The single thread that holds the gate while the count is zero
    /// fires the terminate hook and queues the node; everybody else leaves the
    /// gate as they found it. If the buffer backlog exceeds the threshold, a
    /// bounded sweep follows.
    ///
    /// Returns `None` when this call retired the node, the handle otherwise.
    /// Either way the caller's pin is gone: a returned handle is only an
    /// identity and must not be read through.
    ///
    /// 归还 `node` 上的一个 pin（或锚）。
    /// 计数为正时先递减，然后探测退休门闩。在计数为零时持有门闩的唯一线程触发终止钩子并将节点入队；
    /// 其他线程把门闩恢复原状。若缓冲区积压超过阈值，随后进行有界清扫。
    /// 本次调用使节点退休时返回 `None`，否则返回句柄。无论哪种情况，调用者的 pin 都已归还。
    ///
    /// # Safety
    /// The caller must own the pin it gives back.
    pub unsafe fn release(&self, node: NodePtr<T>) -> Option<NodePtr<T>> {
        let retired = {
            let _op = self.in_flight.enter();
            // SAFETY: the caller's pin keeps the node alive up to the
            // decrement, the in-flight bracket after it.
            let inner = unsafe { node.node() };
            decrement_if_positive(&inner.count);
            self.probe_gate(inner)
        };

        // Outside the bracket: a push that waits for room must not hold the
        // epoch back. The node is ours until it is queued.
        if retired {
            self.retire(node);
        }

        if self.buffer.backlog() > self.retirement_threshold {
            self.sweep(false);
        }

        if retired { None } else { Some(node) }
    }

    fn probe_gate(&self, inner: &RefNode<T>) -> bool {
        loop {
            if inner
                .retire_gate
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }

            if inner.count.load(Ordering::Acquire) == 0 {
                return true;
            }

            inner.retire_gate.store(false, Ordering::Release);

            // A releaser that reached zero while we held the gate has given up
            // on it; take the decision over.
            if inner.count.load(Ordering::Acquire) != 0 {
                return false;
            }
        }
    }

    fn retire(&self, node: NodePtr<T>) {
        if let Some(on_terminate) = &self.on_terminate {
            on_terminate(node);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(node = ?node, "node retired");

        self.buffer.push(node);
    }

    // --- replacement ---

    /// Unconditionally point `link` at `new`.
    ///
    /// `new` gains the link's anchor before it becomes visible; the previous
    /// target (mark stripped) loses it. The mark is cleared.
    ///
    /// 无条件地让 `link` 指向 `new`。`new` 在可见之前获得链接的锚；之前的目标（去掉标记）失去锚。
    ///
    /// # Panics
    /// If `link` was bound to another domain by an earlier store.
    ///
    /// # Safety
    /// The caller must pin `new` for the duration of the call.
    pub unsafe fn store_into(&self, link: &Link<T>, new: Option<NodePtr<T>>) {
        link.bind(self.id);
        if let Some(node) = new {
            unsafe { add_anchor(node) };
        }

        let previous = link.swap(MarkedPtr::from(new));

        if let Some(old) = previous.node() {
            // SAFETY: the anchor we give back is the one the link held.
            unsafe { self.release(old) };
        }
    }

    /// Point `link` at `new` if it still holds `expected` (mark included).
    ///
    /// On success the anchors move as in [`store_into`](Self::store_into) and
    /// the previous word is returned. On failure nothing observable changes
    /// and the current word is reported so the caller can recompute.
    ///
    /// 如果 `link` 仍持有 `expected`（包括标记），则让其指向 `new`。
    /// 成功时锚的移动与 `store_into` 相同并返回之前的字。失败时没有可观察的变化，并报告当前字以便调用者重新计算。
    ///
    /// # Panics
    /// If `link` was bound to another domain by an earlier store.
    ///
    /// # Safety
    /// The caller must pin `new` for the duration of the call.
    pub unsafe fn compare_and_swap(
        &self,
        link: &Link<T>,
        expected: MarkedPtr<T>,
        new: Option<NodePtr<T>>,
    ) -> Result<MarkedPtr<T>, CasError<T>> {
        link.bind(self.id);
        if let Some(node) = new {
            unsafe { add_anchor(node) };
        }

        match link.compare_exchange(expected, MarkedPtr::from(new)) {
            Ok(previous) => {
                if let Some(old) = previous.node() {
                    unsafe { self.release(old) };
                }
                Ok(previous)
            }
            Err(current) => {
                if let Some(node) = new {
                    // The caller's pin is still there, so this never reaches zero.
                    unsafe { node.node() }.count.fetch_sub(1, Ordering::Release);
                }
                Err(CasError { current })
            }
        }
    }

    // --- reclamation ---

    /// Drain the deferred-free buffer.
    ///
    /// With `force == false` the backlog is drained down to
    /// `retirement_threshold / 2`, with `force == true` down to zero. Each
    /// drained node has its payload handed to the free hook (or dropped) and
    /// its storage released.
    ///
    /// Drained nodes are tagged with the current epoch and freed once no
    /// operation that started before they were drained can still be running
    /// (two epoch advances later). Nodes not yet expired stay in a pending
    /// list for a later sweep. That list never outgrows the buffer capacity:
    /// past it, the sweep waits for the short in-flight windows to drain.
    ///
    /// Returns the number of nodes freed by this call.
    ///
    /// 排空延迟释放缓冲区。
    /// `force == false` 时把积压排到 `retirement_threshold / 2`，`force == true` 时排到零。
    /// 每个被排出的节点的负载交给释放钩子（或直接 drop），并释放其存储。
    /// 被排出的节点以当前纪元标记，在纪元推进两次后释放；尚未过期的节点留在待释放列表中。
    /// 该列表不会超过缓冲区容量：超过时清扫会等待短暂的在途窗口排空。
    pub fn sweep(&self, force: bool) -> usize {
        let limit = if force {
            0
        } else {
            self.retirement_threshold / 2
        };

        let batch: Vec<_> = {
            let mut pending = self.pending.lock();

            let mut drained = Vec::new();
            while self.buffer.backlog() > limit {
                match self.buffer.try_pop() {
                    Some(node) => drained.push(node),
                    None => break,
                }
            }
            let epoch = self.in_flight.epoch();
            pending.extend(drained.into_iter().map(|node| (node, epoch)));

            let backoff = Backoff::new();
            let expired = loop {
                // Two advances expire everything tagged so far.
                if self.in_flight.try_advance() {
                    self.in_flight.try_advance();
                }

                let expired = pending
                    .iter()
                    .take_while(|(_, tagged)| self.in_flight.is_expired(*tagged))
                    .count();
                if pending.len() - expired <= self.buffer.capacity() {
                    break expired;
                }
                backoff.snooze();
            };

            #[cfg(feature = "tracing")]
            if pending.len() > expired {
                tracing::debug!(kept = pending.len() - expired, "sweep deferred frees");
            }

            pending.drain(..expired).map(|(node, _)| node).collect()
        };

        let freed = batch.len();
        for node in batch {
            // SAFETY: retired (count zero under the gate), off the buffer, and
            // its epoch has expired, so no operation can still see it.
            unsafe { self.free_node(node) };
        }

        #[cfg(feature = "tracing")]
        if freed > 0 {
            tracing::debug!(freed, backlog = self.buffer.backlog(), "sweep freed nodes");
        }

        freed
    }

    unsafe fn free_node(&self, node: NodePtr<T>) {
        let RefNode { payload, .. } = *unsafe { node.into_box() };
        match &self.on_free {
            Some(on_free) => on_free(payload),
            None => drop(payload),
        }
    }
}

impl<T> Default for ReclaimDomain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ReclaimDomain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimDomain")
            .field("retirement_threshold", &self.retirement_threshold)
            .field("buffer_capacity", &self.buffer.capacity())
            .field("backlog", &self.buffer.backlog())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for ReclaimDomain<T> {
    /// Exhaustive sweep. With `&mut self` nothing is in flight, so every
    /// queued node is freed here.
    ///
    /// 穷尽清扫。持有 `&mut self` 时没有操作在进行，所以所有排队的节点都在这里被释放。
    fn drop(&mut self) {
        self.sweep(true);

        let leftover = std::mem::take(&mut *self.pending.lock());
        for (node, _) in leftover {
            unsafe { self.free_node(node) };
        }
        while let Some(node) = self.buffer.try_pop() {
            unsafe { self.free_node(node) };
        }
    }
}

/// Increment-if-non-zero. A count of zero is final.
///
/// # Safety
/// `node` must not have been freed.
#[inline]
unsafe fn try_pin<T>(node: &RefNode<T>) -> bool {
    let mut count = node.count.load(Ordering::Acquire);
    loop {
        if count == 0 {
            return false;
        }
        match node.count.compare_exchange_weak(
            count,
            count + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => count = actual,
        }
    }
}

#[inline]
fn decrement_if_positive(count: &AtomicUsize) {
    let mut current = count.load(Ordering::Acquire);
    while current > 0 {
        match count.compare_exchange_weak(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// New anchor on a node the caller pins, so the count is at least one.
///
/// # Safety
/// The caller must pin `node`.
#[inline]
pub(crate) unsafe fn add_anchor<T>(node: NodePtr<T>) {
    unsafe { node.node() }.count.fetch_add(1, Ordering::Relaxed);
}
