use crate::ptr::NodePtr;
use crate::sync::{AtomicUsize, Ordering, fence};
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::{Backoff, CachePadded};

/// Bounded FIFO of retired nodes waiting for the sweep.
///
/// Pushing blocks (spinning, then yielding) while the queue is full, so a
/// burst of retirements stalls the releasers instead of growing memory.
/// `writes` and `reads` are cumulative and never decrease; their difference is
/// the backlog. `writes` is bumped before the element is pushed and `reads`
/// after it is popped, so `writes >= reads` holds at every instant.
///
/// 等待清扫的已退休节点的有界 FIFO。
/// 队列满时 push 会阻塞（先自旋，后让出），因此退休突发会拖慢释放者而不是增长内存。
/// `writes` 和 `reads` 是累计值，永不减少；二者之差即积压量。
pub(crate) struct DeferredBuffer<T> {
    queue: ArrayQueue<NodePtr<T>>,
    writes: CachePadded<AtomicUsize>,
    reads: CachePadded<AtomicUsize>,
}

impl<T> DeferredBuffer<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            writes: CachePadded::new(AtomicUsize::new(0)),
            reads: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Blocking push.
    pub(crate) fn push(&self, node: NodePtr<T>) {
        self.writes.fetch_add(1, Ordering::AcqRel);

        let backoff = Backoff::new();
        let mut node = node;
        while let Err(rejected) = self.queue.push(node) {
            node = rejected;
            backoff.snooze();
        }
    }

    /// Non-blocking pop of the oldest entry.
    pub(crate) fn try_pop(&self) -> Option<NodePtr<T>> {
        let node = self.queue.pop()?;
        self.reads.fetch_add(1, Ordering::AcqRel);
        Some(node)
    }

    #[inline]
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    /// `writes - reads`. Reads are loaded first so the result never underflows.
    #[inline]
    pub(crate) fn backlog(&self) -> usize {
        let reads = self.reads();
        self.writes().saturating_sub(reads)
    }
}

/// Two-slot count of operations currently touching nodes they do not pin.
///
/// `dereference` reads a node between loading the link and taking its pin,
/// and `release` probes the gate after giving its pin back. Both run inside
/// [`InFlight::enter`], which registers in the slot of the current epoch.
///
/// The epoch advances only once the slot of the previous epoch has drained.
/// Operations entered since the last advance sit in the other slot, so a
/// steady stream of readers never holds the epoch back. A node taken off the
/// buffer while the epoch was `e` is unreachable by every operation once the
/// epoch reaches `e + 2`.
///
/// 当前正在访问未被自身 pin 住的节点的操作计数，分为两个槽。
/// `dereference` 在加载链接与获取 pin 之间读取节点，`release` 在归还 pin 之后探测门闩。
/// 两者都在 `enter` 内运行，并登记在当前纪元对应的槽中。
/// 只有上一纪元的槽排空后纪元才会推进，因此持续不断的读者不会阻止纪元推进。
/// 在纪元为 `e` 时从缓冲区取出的节点，在纪元到达 `e + 2` 后不再能被任何操作访问。
pub(crate) struct InFlight {
    epoch: CachePadded<AtomicUsize>,
    active: [CachePadded<AtomicUsize>; 2],
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicUsize::new(0)),
            active: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
        }
    }

    #[inline]
    pub(crate) fn enter(&self) -> InFlightGuard<'_> {
        let slot = self.epoch.load(Ordering::SeqCst) & 1;
        self.active[slot].fetch_add(1, Ordering::SeqCst);
        // Pairs with the fence in `try_advance`: an advance that missed this
        // registration also made every earlier unlink visible to our loads.
        fence(Ordering::SeqCst);
        InFlightGuard {
            in_flight: self,
            slot,
        }
    }

    #[inline]
    pub(crate) fn epoch(&self) -> usize {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Move to the next epoch if the previous epoch's slot is empty.
    ///
    /// Callers must be serialized (the domain holds its pending lock).
    pub(crate) fn try_advance(&self) -> bool {
        let epoch = self.epoch.load(Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if self.active[epoch.wrapping_add(1) & 1].load(Ordering::SeqCst) != 0 {
            return false;
        }
        self.epoch.store(epoch.wrapping_add(1), Ordering::SeqCst);
        true
    }

    /// Whether a node taken off the buffer at `tagged` can no longer be seen.
    #[inline]
    pub(crate) fn is_expired(&self, tagged: usize) -> bool {
        self.epoch().wrapping_sub(tagged) >= 2
    }
}

#[must_use]
pub(crate) struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    slot: usize,
}

impl Drop for InFlightGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.in_flight.active[self.slot].fetch_sub(1, Ordering::Release);
    }
}
