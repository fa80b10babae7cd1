//! Sticky error slots
//!
//! Each device keeps the first error recorded since it was last queried.
//! Calls made without a device report into a thread-local slot, so one
//! thread never observes another thread's enumeration failures.

use crate::error::{DenoiseError, ErrorCode};
use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Called synchronously with every recorded error, before it becomes
/// queryable
pub type ErrorCallback = Arc<dyn Fn(ErrorCode, &str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StickyError {
    code: ErrorCode,
    message: String,
}

/// Per-device error slot and callback
#[derive(Default)]
pub struct ErrorState {
    slot: Mutex<Option<StickyError>>,
    callback: Mutex<Option<ErrorCallback>>,
}

impl fmt::Debug for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.slot.lock().map(|s| s.is_some()).unwrap_or(false);
        f.debug_struct("ErrorState").field("pending", &pending).finish()
    }
}

impl ErrorState {
    pub fn set_callback(&self, callback: Option<ErrorCallback>) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = callback;
        }
    }

    /// Record an error; an earlier unqueried error is kept
    pub fn record(&self, err: &DenoiseError) {
        let code = err.code();
        let message = err.message();
        tracing::debug!("device error [{}]: {}", code, message);

        let callback = self.callback.lock().ok().and_then(|c| c.clone());
        if let Some(callback) = callback {
            callback(code, &message);
        }

        if let Ok(mut slot) = self.slot.lock() {
            slot.get_or_insert(StickyError { code, message });
        }
    }

    /// Return the pending error and clear it
    pub fn take(&self) -> (ErrorCode, Option<String>) {
        match self.slot.lock().ok().and_then(|mut s| s.take()) {
            Some(err) => (err.code, Some(err.message)),
            None => (ErrorCode::None, None),
        }
    }
}

thread_local! {
    static GLOBAL_ERROR: RefCell<Option<StickyError>> = const { RefCell::new(None) };
}

/// Record an error for a call made without a device
pub fn record_global_error(err: &DenoiseError) {
    tracing::debug!("error [{}]: {}", err.code(), err);
    GLOBAL_ERROR.with(|slot| {
        slot.borrow_mut().get_or_insert(StickyError {
            code: err.code(),
            message: err.message(),
        });
    });
}

/// Return and clear the calling thread's device-less error
pub fn take_global_error() -> (ErrorCode, Option<String>) {
    GLOBAL_ERROR.with(|slot| match slot.borrow_mut().take() {
        Some(err) => (err.code, Some(err.message)),
        None => (ErrorCode::None, None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_error_wins() {
        let state = ErrorState::default();
        state.record(&DenoiseError::InvalidArgument("first".into()));
        state.record(&DenoiseError::OutOfMemory("second".into()));
        let (code, message) = state.take();
        assert_eq!(code, ErrorCode::InvalidArgument);
        assert_eq!(message.as_deref(), Some("first"));
        assert_eq!(state.take(), (ErrorCode::None, None));
    }

    #[test]
    fn test_callback_sees_every_error() {
        let state = ErrorState::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        state.set_callback(Some(Arc::new(move |code, _msg| {
            assert_ne!(code, ErrorCode::None);
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        state.record(&DenoiseError::Cancelled);
        state.record(&DenoiseError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(state.take().0, ErrorCode::Cancelled);
    }

    #[test]
    fn test_global_slot_is_per_thread() {
        record_global_error(&DenoiseError::InvalidArgument("main".into()));
        let other = std::thread::spawn(take_global_error).join().unwrap();
        assert_eq!(other.0, ErrorCode::None);
        assert_eq!(take_global_error().0, ErrorCode::InvalidArgument);
        assert_eq!(take_global_error().0, ErrorCode::None);
    }
}
