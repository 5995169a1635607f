//! Allow-lists restricting which IDs may appear in a result set.

use bit_vec::BitVec;

/// A bitset of permitted document IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    bits: BitVec,
    len: usize,
}

impl AllowList {
    /// An empty allow-list (permits nothing).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an allow-list from a set of IDs.
    pub fn from_ids<I: IntoIterator<Item = u64>>(ids: I) -> Self {
        let mut list = Self::new();
        for id in ids {
            list.insert(id);
        }
        list
    }

    /// Permit `id`.
    pub fn insert(&mut self, id: u64) {
        let idx = id as usize;
        if idx >= self.bits.len() {
            let grow_to = (idx + 1).next_power_of_two();
            self.bits.grow(grow_to - self.bits.len(), false);
        }
        if !self.bits[idx] {
            self.bits.set(idx, true);
            self.len += 1;
        }
    }

    /// Revoke `id`.
    pub fn remove(&mut self, id: u64) {
        let idx = id as usize;
        if self.bits.get(idx).unwrap_or(false) {
            self.bits.set(idx, false);
            self.len -= 1;
        }
    }

    /// Whether `id` is permitted.
    #[inline]
    pub fn contains(&self, id: u64) -> bool {
        self.bits.get(id as usize).unwrap_or(false)
    }

    /// Number of permitted IDs.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no ID is permitted.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate the permitted IDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, set)| *set)
            .map(|(idx, _)| idx as u64)
    }
}

impl FromIterator<u64> for AllowList {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains_remove() {
        let mut list = AllowList::from_ids([3, 10, 3, 700]);
        assert_eq!(list.len(), 3);
        assert!(list.contains(3));
        assert!(list.contains(700));
        assert!(!list.contains(4));
        assert!(!list.contains(1_000_000));

        list.remove(10);
        list.remove(11);
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![3, 700]);
    }

    #[test]
    fn test_empty() {
        let list = AllowList::new();
        assert!(list.is_empty());
        assert!(!list.contains(0));
    }
}
