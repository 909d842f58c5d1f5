//! World state access for contract handlers, plus the in-process host used by
//! the CLI.
//!
//! Contract code only sees the [`TransactionContext`] and [`ChaincodeStub`]
//! traits. [`WorldState`] and [`Transaction`] are one implementation of them:
//! reads go against committed state, writes are buffered in a write set and
//! applied on [`Transaction::commit`].

use std::collections::BTreeMap;
use std::ops::Bound;

use tracing::{debug, info};

mod snapshot;

pub use snapshot::StateSnapshot;

pub type Key = String;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state key must not be empty")]
    EmptyKey,
    #[error("state query iterator is already closed")]
    IteratorClosed,
    #[error("world state unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot {path} is corrupt: {reason}")]
    CorruptSnapshot { path: String, reason: String },
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot value is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Key,
    pub value: Vec<u8>,
}

/// Result iterator returned by a range query.
///
/// Must be closed once the caller is done with it. The first item requested
/// after `close` is [`StateError::IteratorClosed`]; the iterator is fused after
/// that.
pub trait StateQueryIterator: Iterator<Item = Result<KeyValue, StateError>> {
    fn close(&mut self) -> Result<(), StateError>;
}

/// Key-value accessor handed to contract handlers.
pub trait ChaincodeStub {
    /// `Ok(None)` when nothing is stored at `key`.
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;

    fn put_state(&mut self, key: &str, value: Vec<u8>) -> Result<(), StateError>;

    fn del_state(&mut self, key: &str) -> Result<(), StateError>;

    /// Keys in `[start, end)` in key order. An empty `start` or `end` leaves
    /// that side of the range open.
    fn get_state_by_range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Box<dyn StateQueryIterator + '_>, StateError>;
}

/// Per-invocation handle a contract function runs against.
pub trait TransactionContext {
    fn tx_id(&self) -> &str;

    fn stub(&mut self) -> &mut dyn ChaincodeStub;
}

/// Iterator over a range materialized when the query was opened.
pub struct SnapshotQueryIterator {
    entries: std::vec::IntoIter<KeyValue>,
    closed: bool,
    reported_closed: bool,
}

impl SnapshotQueryIterator {
    pub fn new(entries: Vec<KeyValue>) -> Self {
        Self {
            entries: entries.into_iter(),
            closed: false,
            reported_closed: false,
        }
    }
}

impl Iterator for SnapshotQueryIterator {
    type Item = Result<KeyValue, StateError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            if self.reported_closed {
                return None;
            }
            self.reported_closed = true;
            return Some(Err(StateError::IteratorClosed));
        }
        self.entries.next().map(Ok)
    }
}

impl StateQueryIterator for SnapshotQueryIterator {
    fn close(&mut self) -> Result<(), StateError> {
        if self.closed {
            return Err(StateError::IteratorClosed);
        }
        self.closed = true;
        Ok(())
    }
}

/// Collects `[start, end)` out of an ordered map, honoring open bounds.
pub fn collect_range(entries: &BTreeMap<Key, Vec<u8>>, start: &str, end: &str) -> Vec<KeyValue> {
    if !start.is_empty() && !end.is_empty() && start >= end {
        return Vec::new();
    }
    let lower = if start.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Included(start)
    };
    let upper = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end)
    };
    entries
        .range::<str, _>((lower, upper))
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Committed key-value state of the local host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorldState {
    height: u64,
    entries: BTreeMap<Key, Vec<u8>>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed transactions.
    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn begin(&mut self, tx_id: impl Into<String>) -> Transaction<'_> {
        Transaction {
            tx_id: tx_id.into(),
            state: self,
            writes: BTreeMap::new(),
        }
    }

    /// Runs `f` in a fresh transaction and commits its write set only when it
    /// returns `Ok`.
    pub fn submit<T, E, F>(&mut self, tx_id: impl Into<String>, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
    {
        let mut tx = self.begin(tx_id);
        let out = f(&mut tx)?;
        tx.commit();
        Ok(out)
    }

    /// Runs `f` in a transaction that is always discarded.
    pub fn evaluate<T, E, F>(&mut self, tx_id: impl Into<String>, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
    {
        let mut tx = self.begin(tx_id);
        f(&mut tx)
    }
}

/// A single invocation against a [`WorldState`].
///
/// Reads never observe the transaction's own pending writes.
pub struct Transaction<'a> {
    tx_id: String,
    state: &'a mut WorldState,
    writes: BTreeMap<Key, Option<Vec<u8>>>,
}

impl Transaction<'_> {
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Applies the write set and advances the state height.
    pub fn commit(mut self) -> u64 {
        let writes = std::mem::take(&mut self.writes);
        let count = writes.len();
        for (key, value) in writes {
            match value {
                Some(bytes) => {
                    self.state.entries.insert(key, bytes);
                }
                None => {
                    self.state.entries.remove(&key);
                }
            }
        }
        self.state.height += 1;
        info!(
            tx_id = %self.tx_id,
            writes = count,
            height = self.state.height,
            "transaction committed"
        );
        self.state.height
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.writes.is_empty() {
            debug!(
                tx_id = %self.tx_id,
                writes = self.writes.len(),
                "discarding uncommitted write set"
            );
        }
    }
}

impl ChaincodeStub for Transaction<'_> {
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.state.entries.get(key).cloned())
    }

    fn put_state(&mut self, key: &str, value: Vec<u8>) -> Result<(), StateError> {
        if key.is_empty() {
            return Err(StateError::EmptyKey);
        }
        self.writes.insert(key.to_owned(), Some(value));
        Ok(())
    }

    fn del_state(&mut self, key: &str) -> Result<(), StateError> {
        if key.is_empty() {
            return Err(StateError::EmptyKey);
        }
        self.writes.insert(key.to_owned(), None);
        Ok(())
    }

    fn get_state_by_range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Box<dyn StateQueryIterator + '_>, StateError> {
        let entries = collect_range(&self.state.entries, start, end);
        Ok(Box::new(SnapshotQueryIterator::new(entries)))
    }
}

impl TransactionContext for Transaction<'_> {
    fn tx_id(&self) -> &str {
        &self.tx_id
    }

    fn stub(&mut self) -> &mut dyn ChaincodeStub {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> WorldState {
        let mut state = WorldState::new();
        state
            .submit("seed", |tx| -> Result<(), StateError> {
                for key in ["b", "a", "d", "c"] {
                    tx.put_state(key, key.as_bytes().to_vec())?;
                }
                Ok(())
            })
            .unwrap();
        state
    }

    fn keys(iter: Box<dyn StateQueryIterator + '_>) -> Vec<String> {
        iter.map(|kv| kv.unwrap().key).collect()
    }

    #[test]
    fn commit_applies_puts_and_deletes() {
        let mut state = seeded();
        assert_eq!(state.height(), 1);
        assert_eq!(state.len(), 4);

        let mut tx = state.begin("tx-2");
        tx.put_state("a", b"updated".to_vec()).unwrap();
        tx.del_state("d").unwrap();
        assert_eq!(tx.pending_writes(), 2);
        assert_eq!(tx.commit(), 2);

        assert_eq!(state.get("a"), Some(&b"updated"[..]));
        assert_eq!(state.get("d"), None);
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn reads_do_not_see_own_writes() {
        let mut state = WorldState::new();
        let mut tx = state.begin("tx-1");
        tx.put_state("k", b"v".to_vec()).unwrap();
        assert_eq!(tx.get_state("k").unwrap(), None);
        tx.commit();
        assert_eq!(state.get("k"), Some(&b"v"[..]));
    }

    #[test]
    fn failed_submission_discards_write_set() {
        let mut state = seeded();
        let before = state.clone();
        let result: Result<(), StateError> = state.submit("tx-fail", |tx| {
            tx.put_state("z", b"z".to_vec())?;
            tx.del_state("a")?;
            Err(StateError::Unavailable("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn evaluate_never_commits() {
        let mut state = seeded();
        let before = state.clone();
        state
            .evaluate("query", |tx| tx.put_state("x", b"x".to_vec()))
            .unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn empty_keys_are_rejected() {
        let mut state = WorldState::new();
        let mut tx = state.begin("tx");
        assert!(matches!(
            tx.put_state("", b"v".to_vec()),
            Err(StateError::EmptyKey)
        ));
        assert!(matches!(tx.del_state(""), Err(StateError::EmptyKey)));
    }

    #[test]
    fn range_queries_respect_open_and_half_open_bounds() {
        let mut state = seeded();
        let tx = state.begin("query");
        assert_eq!(keys(tx.get_state_by_range("", "").unwrap()), ["a", "b", "c", "d"]);
        assert_eq!(keys(tx.get_state_by_range("b", "").unwrap()), ["b", "c", "d"]);
        assert_eq!(keys(tx.get_state_by_range("", "c").unwrap()), ["a", "b"]);
        assert_eq!(keys(tx.get_state_by_range("b", "d").unwrap()), ["b", "c"]);
        assert!(keys(tx.get_state_by_range("d", "b").unwrap()).is_empty());
        assert!(keys(tx.get_state_by_range("c", "c").unwrap()).is_empty());
    }

    #[test]
    fn closed_iterator_rejects_further_use() {
        let mut iter = SnapshotQueryIterator::new(vec![KeyValue {
            key: "a".into(),
            value: vec![1],
        }]);
        iter.close().unwrap();
        assert!(matches!(iter.next(), Some(Err(StateError::IteratorClosed))));
        assert!(iter.next().is_none());
        assert!(matches!(iter.close(), Err(StateError::IteratorClosed)));
    }

    #[test]
    fn draining_after_close_terminates() {
        let mut iter = SnapshotQueryIterator::new(vec![
            KeyValue {
                key: "a".into(),
                value: vec![1],
            },
            KeyValue {
                key: "b".into(),
                value: vec![2],
            },
        ]);
        iter.close().unwrap();
        let drained: Vec<_> = iter.by_ref().take(10).collect();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0], Err(StateError::IteratorClosed)));
        assert_eq!(iter.count(), 0);
    }
}
