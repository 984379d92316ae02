//! Cooperative cancellation for kernel dispatches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared cancellation flag handed to `Backend::execute`.
///
/// Once requested, any dispatch carrying the token fails with
/// `BackendError::Cancelled` and must not make partial writes visible to
/// later steps. A token is never reset; create a fresh one per unit of
/// cancellable work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_clear() {
        let t = CancelToken::new();
        assert!(!t.is_requested());
        t.request();
        assert!(t.is_requested());
        // clones observe the same flag
        let u = t.clone();
        assert!(u.is_requested());
    }
}
