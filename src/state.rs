use crate::sync::{AtomicU32, AtomicU8, Ordering};

/// Phase bit: the node's subrange has been reduced and its total published.
pub(crate) const SUMMED: u8 = 0b001;
/// Phase bit: the node has been released to push carries down its subtree.
pub(crate) const CUMULATE: u8 = 0b010;
/// Phase bit: the node's whole subtree holds final prefixes.
pub(crate) const FINISHED: u8 = 0b100;

/// Monotonic phase word of one scan node.
///
/// Bits only ever advance (are added), never retreat. That monotonicity is
/// what resolves sibling races: of two siblings reporting the same bit to a
/// parent, whichever CAS observes the bit already present is the one that
/// proceeds to perform the parent's transition, so each transition fires
/// exactly once regardless of scheduling.
///
/// Kept deliberately separate from [`Pending`]: the phase word carries
/// protocol bits, never an outstanding-children count.
pub(crate) struct Phase(AtomicU8);

impl Phase {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    #[inline]
    pub(crate) fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Attempt the monotonic transition `expected -> expected | bits`.
    ///
    /// On failure returns the freshly observed word so callers can re-enter
    /// their decision loop without an extra load.
    #[inline]
    pub(crate) fn try_advance(&self, expected: u8, bits: u8) -> Result<(), u8> {
        self.0
            .compare_exchange(expected, expected | bits, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
    }

    /// Set `bit` unless some other task already has; returns whether this
    /// call was the one that set it.
    ///
    /// The winner owns whatever follow-up the bit gates (e.g. forking the
    /// node to run its cumulate pass); losers must not repeat it.
    pub(crate) fn set_once(&self, bit: u8) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if cur & bit != 0 {
                return false;
            }
            match self
                .0
                .compare_exchange(cur, cur | bit, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

/// Outstanding-dependency counter of one sort node.
///
/// Follows the completion-counted discipline: a completing dependency
/// *arrives*; the arrival that finds the count already at zero is the one
/// that fires the node's completion hook and continues up the parent chain,
/// all other arrivals just decrement and stop. A count of `n` therefore
/// absorbs `n` arrivals before the `n + 1`-th triggers.
pub(crate) struct Pending(AtomicU32);

impl Pending {
    pub(crate) fn new(count: u32) -> Self {
        Self(AtomicU32::new(count))
    }

    /// Register one more outstanding dependency before it is forked.
    #[inline]
    pub(crate) fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one dependency completion. Returns `true` iff this arrival is
    /// the triggering one (the count was already zero).
    pub(crate) fn arrive(&self) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return true;
            }
            match self
                .0
                .compare_exchange(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return false,
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn phase_advances_monotonically() {
        let phase = Phase::new();
        assert_eq!(phase.get(), 0);
        phase.try_advance(0, SUMMED).unwrap();
        assert_eq!(phase.get(), SUMMED);
        // Stale expectation: the word moved on.
        assert_eq!(phase.try_advance(0, CUMULATE), Err(SUMMED));
        phase.try_advance(SUMMED, CUMULATE | FINISHED).unwrap();
        assert_eq!(phase.get(), SUMMED | CUMULATE | FINISHED);
    }

    #[test]
    fn set_once_has_a_single_winner() {
        let phase = Phase::new();
        assert!(phase.set_once(CUMULATE));
        assert!(!phase.set_once(CUMULATE));
        assert_eq!(phase.get(), CUMULATE);
    }

    #[test]
    fn pending_absorbs_then_triggers() {
        let pending = Pending::new(1);
        assert!(!pending.arrive());
        assert!(pending.arrive());
        // Triggering arrivals do not consume anything.
        assert!(pending.arrive());
    }

    #[test]
    fn pending_bump_adds_a_dependency() {
        let pending = Pending::new(0);
        pending.bump();
        pending.bump();
        assert!(!pending.arrive());
        assert!(!pending.arrive());
        assert!(pending.arrive());
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_model {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    /// The race-resolution crux: two siblings report the same bit to a
    /// shared parent word; exactly one of them must observe the sibling's
    /// bit already present and thereby own the parent transition.
    #[test]
    fn exactly_one_sibling_owns_the_transition() {
        loom::model(|| {
            let parent = Arc::new(Phase::new());

            let report = |parent: Arc<Phase>| {
                let mut word = parent.get();
                loop {
                    if word & SUMMED != 0 {
                        // Sibling already reported: this task transitions.
                        return 1usize;
                    }
                    match parent.try_advance(word, SUMMED) {
                        Ok(()) => return 0,
                        Err(actual) => word = actual,
                    }
                }
            };

            let lhs = {
                let parent = parent.clone();
                thread::spawn(move || report(parent))
            };
            let transitions = report(parent.clone()) + lhs.join().unwrap();

            assert_eq!(transitions, 1);
            assert_eq!(parent.get(), SUMMED);
        });
    }

    #[test]
    fn cumulate_release_has_a_single_winner() {
        loom::model(|| {
            let phase = Arc::new(Phase::new());

            let rhs = {
                let phase = phase.clone();
                thread::spawn(move || usize::from(phase.set_once(CUMULATE)))
            };
            let winners = usize::from(phase.set_once(CUMULATE)) + rhs.join().unwrap();

            assert_eq!(winners, 1);
        });
    }

    /// A relay with pending count 1 absorbs the first of two completions
    /// and fires on the second, no matter how the two interleave.
    #[test]
    fn relay_fires_on_the_second_completion() {
        loom::model(|| {
            let pending = Arc::new(Pending::new(1));

            let rhs = {
                let pending = pending.clone();
                thread::spawn(move || usize::from(pending.arrive()))
            };
            let fired = usize::from(pending.arrive()) + rhs.join().unwrap();

            assert_eq!(fired, 1);
        });
    }
}
