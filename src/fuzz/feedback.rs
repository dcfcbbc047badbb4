use rustc_hash::FxHashSet;
use std::collections::BTreeSet;

/// Locations reached so far by one fuzz job.
#[derive(Debug, Default)]
pub struct Feedback {
    max_cov: FxHashSet<u32>,
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the locations of `cov` not seen before and merges them.
    pub fn check_new(&mut self, cov: impl IntoIterator<Item = u32>) -> BTreeSet<u32> {
        let mut new = BTreeSet::new();
        for c in cov {
            if self.max_cov.insert(c) {
                new.insert(c);
            }
        }
        new
    }

    pub fn len(&self) -> usize {
        self.max_cov.len()
    }

    pub fn is_empty(&self) -> bool {
        self.max_cov.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unseen_locations_are_new() {
        let mut f = Feedback::new();
        assert!(f.is_empty());
        assert_eq!(f.check_new([1, 2, 3]), BTreeSet::from([1, 2, 3]));
        assert_eq!(f.check_new([2, 3, 4]), BTreeSet::from([4]));
        assert!(f.check_new([1, 4]).is_empty());
        assert_eq!(f.len(), 4);
    }

    #[test]
    fn repeats_within_one_run_count_once() {
        let mut f = Feedback::new();
        assert_eq!(f.check_new([5, 5, 6]), BTreeSet::from([5, 6]));
        assert_eq!(f.len(), 2);
    }
}
