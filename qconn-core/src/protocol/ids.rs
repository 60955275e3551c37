use std::sync::atomic::{AtomicI64, Ordering};

/// Slot of the local root answer. The peer sees it as [`ROOT_QUESTION`].
pub const ROOT_ANSWER: i64 = 1;

/// Slot of the question standing for the peer's root object.
pub const ROOT_QUESTION: i64 = -1;

const FIRST_QUESTION: i64 = 3;
const FIRST_EXPORT: i64 = 2;

/// Hands out the ids this side originates.
///
/// Questions take odd ids and by-copy exports take even ids, both counting
/// upward by two, so the two sequences never collide. Ids are positive in the
/// allocator's own frame; the peer reads them negated (see [`peer_view`]).
#[derive(Debug)]
pub struct IdAllocator {
    next_question: AtomicI64,
    next_export: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_question: AtomicI64::new(FIRST_QUESTION),
            next_export: AtomicI64::new(FIRST_EXPORT),
        }
    }

    pub fn allocate_question(&self) -> i64 {
        self.next_question.fetch_add(2, Ordering::SeqCst)
    }

    pub fn allocate_export(&self) -> i64 {
        self.next_export.fetch_add(2, Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates an id between the two frames of reference. Inbound ids are
/// checked with [`is_wire_id`] before they get here.
pub fn peer_view(id: i64) -> i64 {
    id.wrapping_neg()
}

/// True for ids the receiver can negate into its own frame.
pub fn is_wire_id(id: i64) -> bool {
    id != i64::MIN
}

/// True for ids this side allocated.
pub fn is_local(id: i64) -> bool {
    id > 0
}
