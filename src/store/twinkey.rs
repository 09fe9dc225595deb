//! Bijective two-key map.
//!
//! Supports lookups where either the left or right key is unknown. When both
//! keys are given, the lookup succeeds only if they point to the same entry.
//! Entries keep insertion order, so persisted documents stay stable.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Failure modes of [TwinKeyDict] operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TwinKeyError {
    /// Both lookup keys were absent
    NullKeys,
    /// No entry with the given left key
    LeftNotFound,
    /// No entry with the given right key
    RightNotFound,
    /// The given keys point to different entries
    Mismatch,
    /// The left key is already paired with another right key
    DuplicateLeft,
    /// The right key is already paired with another left key
    DuplicateRight,
}

impl fmt::Display for TwinKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::NullKeys => "lookup without keys is not allowed",
            Self::LeftNotFound => "no entry with the given left key",
            Self::RightNotFound => "no entry with the given right key",
            Self::Mismatch => "keys point to different entries",
            Self::DuplicateLeft => "left key is already in use",
            Self::DuplicateRight => "right key is already in use",
        };
        write!(f, "{message}")
    }
}

/// One entry of a [TwinKeyDict]
#[derive(Clone, Debug, PartialEq)]
pub struct TwinKeyEntry<L, R, V> {
    pub left: L,
    pub right: R,
    pub value: V,
}

/// Insertion-ordered map indexed by two independently unique keys.
#[derive(Clone, Debug)]
pub struct TwinKeyDict<L, R, V> {
    entries: Vec<Option<TwinKeyEntry<L, R, V>>>,
    left_index: HashMap<L, usize>,
    right_index: HashMap<R, usize>,
}

impl<L, R, V> Default for TwinKeyDict<L, R, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            left_index: HashMap::new(),
            right_index: HashMap::new(),
        }
    }
}

impl<L, R, V> TwinKeyDict<L, R, V>
where
    L: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
{
    /// Creates an empty dict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of entries.
    pub fn len(&self) -> usize {
        self.left_index.len()
    }

    /// Gets whether the dict is empty.
    pub fn is_empty(&self) -> bool {
        self.left_index.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TwinKeyEntry<L, R, V>> {
        self.entries.iter().flatten()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.left_index.clear();
        self.right_index.clear();
    }

    fn index_of(&self, left: Option<&L>, right: Option<&R>) -> Result<usize, TwinKeyError> {
        match (left, right) {
            (None, None) => Err(TwinKeyError::NullKeys),
            (Some(left), None) => self
                .left_index
                .get(left)
                .copied()
                .ok_or(TwinKeyError::LeftNotFound),
            (None, Some(right)) => self
                .right_index
                .get(right)
                .copied()
                .ok_or(TwinKeyError::RightNotFound),
            (Some(left), Some(right)) => {
                let idx = self
                    .left_index
                    .get(left)
                    .copied()
                    .ok_or(TwinKeyError::LeftNotFound)?;
                match self.right_index.get(right) {
                    Some(&right_idx) if right_idx == idx => Ok(idx),
                    _ => Err(TwinKeyError::Mismatch),
                }
            }
        }
    }

    fn entry_at(&self, idx: usize) -> &TwinKeyEntry<L, R, V> {
        self.entries[idx]
            .as_ref()
            .unwrap_or_else(|| unreachable!("indexed entry is always present"))
    }

    /// Looks up an entry by either or both keys.
    pub fn get(
        &self,
        left: Option<&L>,
        right: Option<&R>,
    ) -> Result<&TwinKeyEntry<L, R, V>, TwinKeyError> {
        self.index_of(left, right).map(|idx| self.entry_at(idx))
    }

    /// Gets whether a (possibly partial) key pair resolves to an entry.
    pub fn contains(&self, left: Option<&L>, right: Option<&R>) -> bool {
        self.index_of(left, right).is_ok()
    }

    /// Gets the left key paired with a right key.
    pub fn left_key(&self, right: &R) -> Option<&L> {
        self.right_index
            .get(right)
            .map(|&idx| &self.entry_at(idx).left)
    }

    /// Gets the right key paired with a left key.
    pub fn right_key(&self, left: &L) -> Option<&R> {
        self.left_index
            .get(left)
            .map(|&idx| &self.entry_at(idx).right)
    }

    /// Inserts an entry.
    ///
    /// Re-inserting the exact key pair replaces its value. A collision with
    /// a different entry on either key fails without changes.
    pub fn insert(&mut self, left: L, right: R, value: V) -> Result<(), TwinKeyError> {
        match (self.left_index.get(&left), self.right_index.get(&right)) {
            (Some(&l), Some(&r)) if l == r => {
                self.entries[l] = Some(TwinKeyEntry { left, right, value });
                Ok(())
            }
            (Some(_), _) => Err(TwinKeyError::DuplicateLeft),
            (_, Some(_)) => Err(TwinKeyError::DuplicateRight),
            (None, None) => {
                let idx = self.entries.len();
                self.left_index.insert(left.clone(), idx);
                self.right_index.insert(right.clone(), idx);
                self.entries.push(Some(TwinKeyEntry { left, right, value }));
                Ok(())
            }
        }
    }

    /// Removes the entry matched by either key.
    pub fn remove(
        &mut self,
        left: Option<&L>,
        right: Option<&R>,
    ) -> Result<TwinKeyEntry<L, R, V>, TwinKeyError> {
        let idx = self.index_of(left, right)?;
        let entry = self.entries[idx]
            .take()
            .unwrap_or_else(|| unreachable!("indexed entry is always present"));
        self.left_index.remove(&entry.left);
        self.right_index.remove(&entry.right);
        Ok(entry)
    }

    /// Renames an entry.
    ///
    /// Partial keys are permitted on either side; absent new keys keep their
    /// old value. Renaming an entry to its own keys is a no-op. A collision
    /// with a different entry fails without changes.
    pub fn rename(
        &mut self,
        old: (Option<&L>, Option<&R>),
        new: (Option<&L>, Option<&R>),
    ) -> Result<(), TwinKeyError>
    where
        V: Clone,
    {
        if new.0.is_none() && new.1.is_none() {
            return Err(TwinKeyError::NullKeys);
        }

        let idx = self.index_of(old.0, old.1)?;
        let entry = self.entry_at(idx);

        let new_left = new.0.unwrap_or(&entry.left).clone();
        let new_right = new.1.unwrap_or(&entry.right).clone();

        if new_left == entry.left && new_right == entry.right {
            return Ok(());
        }
        if new_left != entry.left && self.left_index.contains_key(&new_left) {
            return Err(TwinKeyError::DuplicateLeft);
        }
        if new_right != entry.right && self.right_index.contains_key(&new_right) {
            return Err(TwinKeyError::DuplicateRight);
        }

        let entry = self.remove(old.0, old.1)?;
        self.insert(new_left, new_right, entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<(&'static str, u16, &'static str)> {
        vec![("left", 1, "first"), ("middle", 2, "second"), ("right", 3, "third")]
    }

    fn filled() -> TwinKeyDict<String, u16, String> {
        let mut dict = TwinKeyDict::new();
        for (left, right, value) in items() {
            dict.insert(left.into(), right, value.into()).unwrap();
        }
        dict
    }

    #[test]
    fn test_get_set() {
        let mut dict = filled();

        for (left, right, value) in items() {
            let left = left.to_string();
            assert_eq!(dict.get(Some(&left), None).unwrap().value, value);
            assert_eq!(dict.get(None, Some(&right)).unwrap().value, value);
            assert_eq!(dict.get(Some(&left), Some(&right)).unwrap().value, value);
            assert!(dict.contains(Some(&left), Some(&right)));
        }

        // Updating the exact pair replaces the value
        dict.insert("left".into(), 1, "update".into()).unwrap();
        assert_eq!(dict.get(None, Some(&1)).unwrap().value, "update");
        assert_eq!(dict.len(), 3);

        // Mismatched pairs
        assert_eq!(
            dict.get(Some(&"left".into()), Some(&2)).unwrap_err(),
            TwinKeyError::Mismatch
        );
        assert_eq!(
            dict.insert("left".into(), 9, "mismatch".into()).unwrap_err(),
            TwinKeyError::DuplicateLeft
        );
        assert_eq!(
            dict.insert("other".into(), 1, "mismatch".into()).unwrap_err(),
            TwinKeyError::DuplicateRight
        );

        // Null keys
        assert_eq!(dict.get(None, None).unwrap_err(), TwinKeyError::NullKeys);
    }

    #[test]
    fn test_remove() {
        let mut dict = filled();

        dict.remove(Some(&"left".into()), None).unwrap();
        assert_eq!(dict.len(), 2);
        assert!(!dict.contains(Some(&"left".into()), None));
        assert!(!dict.contains(None, Some(&1)));

        let entry = dict.remove(None, Some(&2)).unwrap();
        assert_eq!(entry.left, "middle");
        assert_eq!(
            dict.remove(None, Some(&2)).unwrap_err(),
            TwinKeyError::RightNotFound
        );
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_rename() {
        let mut dict: TwinKeyDict<String, u16, String> = TwinKeyDict::new();
        dict.insert("wabber".into(), 1, "alice".into()).unwrap();

        dict.rename((Some(&"wabber".into()), None), (Some(&"blobber".into()), None))
            .unwrap();
        assert!(!dict.contains(Some(&"wabber".into()), None));
        assert_eq!(dict.get(Some(&"blobber".into()), Some(&1)).unwrap().value, "alice");

        dict.rename((None, Some(&1)), (None, Some(&2))).unwrap();
        assert_eq!(dict.get(Some(&"blobber".into()), Some(&2)).unwrap().value, "alice");

        dict.rename(
            (Some(&"blobber".into()), Some(&2)),
            (Some(&"something".into()), Some(&3)),
        )
        .unwrap();
        assert!(dict.contains(Some(&"something".into()), Some(&3)));

        assert_eq!(
            dict.rename((Some(&"something".into()), None), (None, None))
                .unwrap_err(),
            TwinKeyError::NullKeys
        );
        assert_eq!(
            dict.rename((None, None), (Some(&"anything".into()), None))
                .unwrap_err(),
            TwinKeyError::NullKeys
        );
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_rename_to_self_is_noop() {
        let mut dict = filled();
        dict.rename((Some(&"left".into()), Some(&1)), (Some(&"left".into()), Some(&1)))
            .unwrap();
        assert_eq!(dict.get(Some(&"left".into()), None).unwrap().value, "first");
        assert_eq!(dict.len(), 3);
    }

    #[test]
    fn test_rename_collision_leaves_store_unchanged() {
        let mut dict: TwinKeyDict<String, u16, String> = TwinKeyDict::new();
        dict.insert("A".into(), 100, "a".into()).unwrap();
        dict.insert("B".into(), 101, "b".into()).unwrap();

        let err = dict
            .rename((Some(&"A".into()), None), (Some(&"B".into()), None))
            .unwrap_err();
        assert_eq!(err, TwinKeyError::DuplicateLeft);

        assert_eq!(dict.get(Some(&"A".into()), Some(&100)).unwrap().value, "a");
        assert_eq!(dict.get(Some(&"B".into()), Some(&101)).unwrap().value, "b");
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_iterate_keeps_insertion_order() {
        let dict = filled();
        let lefts: Vec<_> = dict.iter().map(|e| e.left.as_str()).collect();
        assert_eq!(lefts, vec!["left", "middle", "right"]);
    }

    #[test]
    fn test_invariants_hold_after_operations() {
        let mut dict = filled();
        dict.insert("extra".into(), 9, "nine".into()).unwrap();
        dict.remove(None, Some(&2)).unwrap();
        dict.rename((Some(&"right".into()), None), (None, Some(&30)))
            .unwrap();

        // Every entry resolves identically through both indices
        for entry in dict.iter() {
            assert_eq!(dict.left_key(&entry.right), Some(&entry.left));
            assert_eq!(dict.right_key(&entry.left), Some(&entry.right));
            assert!(dict.contains(Some(&entry.left), Some(&entry.right)));
        }
        assert_eq!(dict.iter().count(), dict.len());
    }
}
