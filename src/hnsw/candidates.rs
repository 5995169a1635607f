//! Priority structures used during graph traversal.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A node ID paired with its distance to the current query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Node ID in the graph.
    pub id: u64,
    /// Distance to the query vector.
    pub distance: f32,
}

impl Candidate {
    pub fn new(id: u64, distance: f32) -> Self {
        Self { id, distance }
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    /// Ascending by distance; equal distances order by ascending ID.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Min-first queue of nodes still to expand.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    heap: BinaryHeap<Reverse<Candidate>>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: Candidate) {
        self.heap.push(Reverse(candidate));
    }

    pub fn pop(&mut self) -> Option<Candidate> {
        self.heap.pop().map(|Reverse(c)| c)
    }
}

/// The best `capacity` nodes seen so far, with O(1) access to the worst.
#[derive(Debug)]
pub struct ResultSet {
    heap: BinaryHeap<Candidate>,
    capacity: usize,
}

impl ResultSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity + 1),
            capacity: capacity.max(1),
        }
    }

    /// Admit `candidate`, evicting the worst result on overflow.
    pub fn push(&mut self, candidate: Candidate) {
        if self.is_full() {
            match self.heap.peek() {
                Some(worst) if candidate < *worst => {
                    self.heap.pop();
                }
                _ => return,
            }
        }
        self.heap.push(candidate);
    }

    /// Whether `distance` could still enter the set.
    pub fn accepts(&self, distance: f32) -> bool {
        !self.is_full() || self.worst().is_none_or(|worst| distance < worst)
    }

    pub fn worst(&self) -> Option<f32> {
        self.heap.peek().map(|c| c.distance)
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Results sorted ascending by distance.
    pub fn into_sorted_vec(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_queue_is_min_first() {
        let mut queue = CandidateQueue::new();
        queue.push(Candidate::new(1, 0.5));
        queue.push(Candidate::new(2, 0.1));
        queue.push(Candidate::new(3, 0.9));
        assert_eq!(queue.pop().map(|c| c.id), Some(2));
        assert_eq!(queue.pop().map(|c| c.id), Some(1));
        assert_eq!(queue.pop().map(|c| c.id), Some(3));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_result_set_keeps_best() {
        let mut results = ResultSet::new(2);
        results.push(Candidate::new(1, 0.5));
        results.push(Candidate::new(2, 0.9));
        assert!(results.is_full());
        assert_eq!(results.worst(), Some(0.9));

        results.push(Candidate::new(3, 0.1));
        assert_eq!(results.worst(), Some(0.5));
        assert!(!results.accepts(0.7));
        assert!(results.accepts(0.2));

        let ids: Vec<u64> = results.into_sorted_vec().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn test_ties_prefer_lower_id() {
        let mut results = ResultSet::new(2);
        results.push(Candidate::new(9, 1.0));
        results.push(Candidate::new(4, 1.0));
        results.push(Candidate::new(6, 1.0));
        let ids: Vec<u64> = results.into_sorted_vec().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![4, 6]);
    }
}
