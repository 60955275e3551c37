use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet};

use crate::value::Value;

/// Capacity-bounded id table with least-recently-used eviction.
///
/// Pinned ids are never evicted and do not count against the capacity.
#[derive(Debug)]
pub struct RefTable<V> {
    entries: IndexMap<i64, V>,
    pinned: HashSet<i64>,
    capacity: usize,
}

impl<V> RefTable<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            pinned: HashSet::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pin(&mut self, id: i64) {
        self.pinned.insert(id);
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, id: i64) -> Option<&V> {
        let index = self.entries.get_index_of(&id)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        self.entries.get_index(last).map(|(_, v)| v)
    }

    /// Look up an entry without touching its recency.
    pub fn peek(&self, id: i64) -> Option<&V> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Insert a new entry as most recently used, returning whatever had to
    /// be evicted to stay within capacity.
    pub fn insert(&mut self, id: i64, value: V) -> Result<Vec<(i64, V)>, TableError> {
        if self.entries.contains_key(&id) {
            return Err(TableError::Duplicate(id));
        }
        self.entries.insert(id, value);
        Ok(self.evict())
    }

    pub fn remove(&mut self, id: i64) -> Option<V> {
        self.entries.shift_remove(&id)
    }

    pub fn drain(&mut self) -> Vec<(i64, V)> {
        self.entries.drain(..).collect()
    }

    /// Number of entries, pinned ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unpinned_len(&self) -> usize {
        self.entries.len()
            - self
                .pinned
                .iter()
                .filter(|id| self.entries.contains_key(*id))
                .count()
    }

    fn evict(&mut self) -> Vec<(i64, V)> {
        let mut evicted = Vec::new();
        while self.unpinned_len() > self.capacity {
            let oldest = self
                .entries
                .keys()
                .copied()
                .find(|id| !self.pinned.contains(id));
            match oldest.and_then(|id| self.entries.shift_remove_entry(&id)) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }
}

/// A reference token as it appears on the wire, in this side's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireRef {
    /// `{"@": q}`
    Question(i64),
    /// `{"@": q, "$": e}`
    Handle { question: i64, export: i64 },
    /// `{"->": q}`
    Callable(i64),
    /// `{"$": e}`
    Export(i64),
}

impl WireRef {
    pub fn to_json(self) -> JsonValue {
        match self {
            WireRef::Question(q) => json!({"@": q}),
            WireRef::Handle { question, export } => json!({"@": question, "$": export}),
            WireRef::Callable(q) => json!({"->": q}),
            WireRef::Export(e) => json!({"$": e}),
        }
    }

    fn slots(self) -> [Option<i64>; 2] {
        match self {
            WireRef::Question(q) | WireRef::Callable(q) => [Some(q), None],
            WireRef::Handle { question, export } => [Some(question), Some(export)],
            WireRef::Export(e) => [Some(e), None],
        }
    }

    fn mentions(self, slot: i64) -> bool {
        self.slots().contains(&Some(slot))
    }
}

struct MemoEntry {
    // Held so the address behind the identity key cannot be reused while
    // the entry exists.
    _value: Value,
    token: WireRef,
}

/// Maps in-memory value identity to the wire reference already assigned to
/// it, so a value crossing the wire twice keeps one identity.
#[derive(Default)]
pub struct Memo {
    by_identity: HashMap<usize, MemoEntry>,
    by_slot: HashMap<i64, Vec<usize>>,
}

impl Memo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, value: &Value) -> Option<WireRef> {
        let identity = value.identity()?;
        self.by_identity.get(&identity).map(|entry| entry.token)
    }

    /// Records `token` for `value`. Primitives are not memoized.
    pub fn insert(&mut self, value: &Value, token: WireRef) {
        let Some(identity) = value.identity() else {
            return;
        };
        for slot in token.slots().into_iter().flatten() {
            self.by_slot.entry(slot).or_default().push(identity);
        }
        self.by_identity.insert(
            identity,
            MemoEntry {
                _value: value.clone(),
                token,
            },
        );
    }

    /// Drops every entry whose token names `slot`.
    pub fn forget_slot(&mut self, slot: i64) -> usize {
        let Some(identities) = self.by_slot.remove(&slot) else {
            return 0;
        };
        let mut forgotten = 0;
        for identity in identities {
            let stale = self
                .by_identity
                .get(&identity)
                .is_some_and(|entry| entry.token.mentions(slot));
            if stale {
                self.by_identity.remove(&identity);
                forgotten += 1;
            }
        }
        forgotten
    }

    pub fn clear(&mut self) {
        self.by_identity.clear();
        self.by_slot.clear();
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }
}

impl std::fmt::Debug for Memo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memo")
            .field("entries", &self.by_identity.len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("Slot already present: {0}")]
    Duplicate(i64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Array, Object};

    #[test]
    fn test_lru_eviction_order() {
        let mut table = RefTable::new(2);
        assert!(table.insert(3, "a").unwrap().is_empty());
        assert!(table.insert(5, "b").unwrap().is_empty());

        // Touch 3 so 5 becomes the oldest.
        assert_eq!(table.get(3), Some(&"a"));
        let evicted = table.insert(7, "c").unwrap();
        assert_eq!(evicted, vec![(5, "b")]);
        assert!(table.contains(3));
        assert!(table.contains(7));
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut table = RefTable::new(2);
        table.insert(3, 'a').unwrap();
        table.insert(5, 'b').unwrap();
        assert_eq!(table.peek(3), Some(&'a'));
        let evicted = table.insert(7, 'c').unwrap();
        assert_eq!(evicted, vec![(3, 'a')]);
    }

    #[test]
    fn test_pinned_entries_survive() {
        let mut table = RefTable::new(1);
        table.pin(1);
        table.pin(-1);
        table.insert(1, "root").unwrap();
        table.insert(-1, "peer root").unwrap();
        table.insert(3, "first").unwrap();
        let evicted = table.insert(5, "second").unwrap();

        assert_eq!(evicted, vec![(3, "first")]);
        assert!(table.contains(1));
        assert!(table.contains(-1));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut table = RefTable::new(4);
        table.insert(3, ()).unwrap();
        assert_eq!(table.insert(3, ()), Err(TableError::Duplicate(3)));
    }

    #[test]
    fn test_unbounded_table_never_evicts() {
        let mut table = RefTable::new(usize::MAX);
        for id in 0..1000 {
            assert!(table.insert(id, id).unwrap().is_empty());
        }
        assert_eq!(table.drain().len(), 1000);
        assert!(table.is_empty());
    }

    #[test]
    fn test_wire_ref_tokens() {
        assert_eq!(WireRef::Question(3).to_json(), json!({"@": 3}));
        assert_eq!(
            WireRef::Handle { question: 5, export: 2 }.to_json(),
            json!({"@": 5, "$": 2})
        );
        assert_eq!(WireRef::Callable(7).to_json(), json!({"->": 7}));
        assert_eq!(WireRef::Export(-4).to_json(), json!({"$": -4}));
    }

    #[test]
    fn test_memo_by_identity() {
        let mut memo = Memo::new();
        let a = Value::Object(Object::new());
        let b = Value::Object(Object::new());
        memo.insert(&a, WireRef::Export(2));

        assert_eq!(memo.get(&a), Some(WireRef::Export(2)));
        assert_eq!(memo.get(&a.clone()), Some(WireRef::Export(2)));
        assert_eq!(memo.get(&b), None);

        memo.insert(&Value::from(1), WireRef::Export(4));
        assert_eq!(memo.len(), 1);
    }

    #[test]
    fn test_memo_forget_slot() {
        let mut memo = Memo::new();
        let handle = Value::Array(Array::new().by_reference());
        let copy = Value::Object(Object::new());
        memo.insert(&handle, WireRef::Handle { question: 3, export: 2 });
        memo.insert(&copy, WireRef::Export(4));

        assert_eq!(memo.forget_slot(3), 1);
        assert_eq!(memo.get(&handle), None);
        assert_eq!(memo.get(&copy), Some(WireRef::Export(4)));

        // The other slot of the removed handle no longer finds anything.
        assert_eq!(memo.forget_slot(2), 0);
    }
}
