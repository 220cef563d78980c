//! Grouping of observations for the random effects.

use std::collections::HashMap;
use std::ops::Range;

/// Observations sorted by group, with the contiguous row range of each group.
#[derive(Debug, Clone)]
pub struct Groups {
    /// Sorted position -> caller's row index.
    order: Vec<usize>,
    /// Unique group ids, ascending.
    ids: Vec<i64>,
    /// Start row of each group in sorted order, plus the total row count.
    starts: Vec<usize>,
    index: HashMap<i64, usize>,
}

impl Groups {
    /// Stable sort of the rows by group id.
    pub fn new(group_id: &[i64]) -> Self {
        let mut order: Vec<usize> = (0..group_id.len()).collect();
        order.sort_by_key(|&i| group_id[i]);

        let mut ids = Vec::new();
        let mut starts = Vec::new();
        for (pos, &row) in order.iter().enumerate() {
            let id = group_id[row];
            if ids.last() != Some(&id) {
                ids.push(id);
                starts.push(pos);
            }
        }
        starts.push(order.len());

        let index = ids.iter().enumerate().map(|(g, &id)| (id, g)).collect();
        Self {
            order,
            ids,
            starts,
            index,
        }
    }

    /// One group per observation.
    pub fn singletons(n_obs: usize) -> Self {
        let ids: Vec<i64> = (0..n_obs as i64).collect();
        Self::new(&ids)
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn n_obs(&self) -> usize {
        self.order.len()
    }

    /// Unique group ids, ascending.
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.starts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Sorted rows belonging to group `g`.
    pub fn rows(&self, g: usize) -> Range<usize> {
        self.starts[g]..self.starts[g + 1]
    }

    /// Sorted position -> caller's row index.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Position of a group id among the unique ids.
    pub fn position(&self, id: i64) -> Option<usize> {
        self.index.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_are_sorted_and_stable() {
        let groups = Groups::new(&[5, 2, 5, 2, 9]);
        assert_eq!(groups.ids(), &[2, 5, 9]);
        assert_eq!(groups.sizes(), vec![2, 2, 1]);
        assert_eq!(groups.order(), &[1, 3, 0, 2, 4]);
        assert_eq!(groups.rows(1), 2..4);
        assert_eq!(groups.position(9), Some(2));
        assert_eq!(groups.position(3), None);
    }

    #[test]
    fn test_singletons() {
        let groups = Groups::singletons(3);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups.order(), &[0, 1, 2]);
    }
}
