use crate::ptr::MarkedPtr;
use std::fmt;
use thiserror::Error;

/// Returned by a failed compare-and-swap on a [`Link`]: the expected word was
/// stale. Nothing was mutated; re-read and retry.
///
/// 链接上的 compare-and-swap 失败时返回：期望值已过期。没有任何修改；请重读后重试。
///
/// [`Link`]: crate::Link
#[derive(Error)]
#[error("link no longer holds the expected node")]
pub struct CasError<T> {
    /// The word the link held when the swap was attempted.
    pub current: MarkedPtr<T>,
}

impl<T> fmt::Debug for CasError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CasError")
            .field("current", &self.current)
            .finish()
    }
}

impl<T> Clone for CasError<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CasError<T> {}

/// Errors reported by a [`KeyedStore`].
///
/// [`KeyedStore`]: crate::KeyedStore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
}
