use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation handle shared between a caller and a blocking
/// operation such as [`Instance::start_with_cancel`] or
/// [`Instance::stop_with_cancel`].
///
/// Cloning yields another handle to the same flag. Cancellation is sticky.
///
/// [`Instance::start_with_cancel`]: crate::Instance::start_with_cancel
/// [`Instance::stop_with_cancel`]: crate::Instance::stop_with_cancel
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_sticky_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
