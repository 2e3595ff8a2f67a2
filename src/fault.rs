use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Captured panic payload of a failed operation.
pub(crate) type Payload = Box<dyn Any + Send + 'static>;

/// Exceptional-completion slot shared by every task of one operation.
///
/// The first task whose body panics parks its payload here; every task
/// checks the flag on entry and backs out without doing work once it is
/// raised, so the whole operation winds down and the failure surfaces at
/// the root exactly once. The array contents are left unspecified, which
/// is the documented contract for in-place parallel mutation.
pub(crate) struct FaultSlot {
    raised: AtomicBool,
    payload: Mutex<Option<Payload>>,
}

impl FaultSlot {
    pub(crate) fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            payload: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Relaxed)
    }

    /// Run `body`, converting a panic into the operation's exceptional
    /// completion. Later panics lose the race and are dropped; the first
    /// one is what the caller observes.
    pub(crate) fn guard(&self, body: impl FnOnce()) {
        if self.is_raised() {
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(body)) {
            if !self.raised.swap(true, Ordering::AcqRel) {
                *self
                    .payload
                    .lock()
                    .expect("FaultSlot::guard: [1]") = Some(payload);
            }
        }
    }

    /// Re-raise the captured failure on the calling thread, if any.
    pub(crate) fn rethrow(self) {
        if self.raised.into_inner() {
            let payload = self
                .payload
                .into_inner()
                .expect("FaultSlot::rethrow: [1]")
                .expect("FaultSlot::rethrow: [2]");
            resume_unwind(payload);
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn first_panic_wins_and_rethrows() {
        let slot = FaultSlot::new();
        slot.guard(|| panic!("first"));
        slot.guard(|| panic!("second"));
        assert!(slot.is_raised());
        let err = catch_unwind(AssertUnwindSafe(|| slot.rethrow())).unwrap_err();
        assert_eq!(err.downcast_ref::<&str>(), Some(&"first"));
    }

    #[test]
    fn guard_skips_work_once_raised() {
        let slot = FaultSlot::new();
        slot.guard(|| panic!("boom"));
        let mut ran = false;
        slot.guard(|| ran = true);
        assert!(!ran);
    }

    #[test]
    fn clean_slot_rethrows_nothing() {
        let slot = FaultSlot::new();
        slot.guard(|| ());
        slot.rethrow();
    }
}
