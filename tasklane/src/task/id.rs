use std::fmt;

/// Counter value reserved for "no group". Live counters are always odd so
/// they never collide with it, even after wrapping around.
pub(crate) const INVALID_GROUP_COUNTER: u32 = 0;

/// First counter handed out for a freshly allocated slot.
pub(crate) const FIRST_GROUP_COUNTER: u32 = 1;

/// A generational handle to one occupancy of a task group slot.
///
/// Group slots are recycled. A handle stays meaningful forever though: once
/// the group it refers to has finished, the slot counter has moved on and
/// every query through the old handle reports "finished". Waiting on such a
/// stale handle returns immediately.
///
/// `TaskGroupId::default()` is the invalid handle, it never refers to a group.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskGroupId {
    pub(crate) slot: u32,
    pub(crate) counter: u32,
}

impl TaskGroupId {
    pub(crate) fn new(slot: u32, counter: u32) -> Self {
        debug_assert_ne!(counter, INVALID_GROUP_COUNTER, "group counter can't be zero");
        Self { slot, counter }
    }

    /// Returns false for the default handle.
    pub fn is_valid(&self) -> bool {
        self.counter != INVALID_GROUP_COUNTER
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl fmt::Display for TaskGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.counter)
    }
}

/// Advances a group counter. Counters start at 1 and always move by 2, which
/// keeps them odd, so zero stays free for [`INVALID_GROUP_COUNTER`] no matter
/// how many times the slot wraps around.
#[inline]
pub(crate) fn next_group_counter(counter: u32) -> u32 {
    counter.wrapping_add(2)
}
