use crate::sync::{AtomicBool, AtomicUsize};

/// Default retirement threshold (backlog of retired nodes before a sweep).
/// 默认退休阈值（触发清扫前允许积压的已退休节点数）。
pub(crate) const DEFAULT_RETIREMENT_THRESHOLD: usize = 64;

/// Smallest capacity of the deferred-free buffer, whatever the threshold.
/// 延迟释放缓冲区的最小容量，与阈值无关。
pub(crate) const MIN_BUFFER_CAPACITY: usize = 1 << 8;

/// Largest accepted retirement threshold. The buffer is allocated up front,
/// so larger requests are clamped to this.
/// 可接受的最大退休阈值。缓冲区是预先分配的，更大的请求会被截断到该值。
pub(crate) const MAX_RETIREMENT_THRESHOLD: usize = 1 << 16;

/// Low pointer bit used as the "logically removed" mark of a link.
/// 用作链接"逻辑删除"标记的指针最低位。
pub(crate) const REMOVED_MARK: usize = 0b1;

/// Threshold actually used for a requested one.
#[inline]
pub(crate) fn clamp_threshold(threshold: usize) -> usize {
    threshold.min(MAX_RETIREMENT_THRESHOLD)
}

/// Capacity of the deferred-free buffer for a given threshold:
/// `max(1.5 × threshold, MIN_BUFFER_CAPACITY)`, the threshold clamped first.
/// 给定阈值下延迟释放缓冲区的容量。
#[inline]
pub(crate) fn buffer_capacity(threshold: usize) -> usize {
    let threshold = clamp_threshold(threshold);
    (threshold + threshold / 2).max(MIN_BUFFER_CAPACITY)
}

/// The reference-counted unit of ownership.
///
/// `count` is the number of outstanding pins plus anchor edges. Once it has
/// been observed at zero it never rises again.
/// `retire_gate` is a single-acquire flag: whoever holds it decides whether
/// the node is dead. It stays `true` forever once the node is retired.
///
/// 引用计数的所有权单元。
/// `count` 是未释放的 pin 数加上锚定边数。一旦观察到为零，就不会再增加。
/// `retire_gate` 是单次获取标志：持有者决定节点是否死亡。节点退休后它永远为 `true`。
#[repr(align(8))]
pub(crate) struct RefNode<T> {
    pub(crate) payload: T,
    pub(crate) count: AtomicUsize,
    pub(crate) retire_gate: AtomicBool,
}

impl<T> RefNode<T> {
    #[inline]
    pub(crate) fn new(payload: T) -> Self {
        Self {
            payload,
            count: AtomicUsize::new(1),
            retire_gate: AtomicBool::new(false),
        }
    }
}
