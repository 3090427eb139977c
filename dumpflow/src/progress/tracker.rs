//! Decile progress computation.

/// Computes coarse completion percentages for a fixed number of work items.
///
/// `advance` returns a percent only when it lands on a multiple of ten that
/// was not published before, so a run publishes at most ten values, in
/// strictly increasing order, never above 100.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: usize,
    processed: usize,
    last_published: u8,
}

impl ProgressTracker {
    /// Creates a tracker for `total` items. Skipped items must not be counted.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            last_published: 0,
        }
    }

    /// Total number of items.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Items processed so far.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Current floor percentage.
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        // processed <= total, so the quotient is at most 100.
        u8::try_from(self.processed * 100 / self.total).unwrap_or(100)
    }

    /// Records one processed item and returns a decile to publish, if any.
    pub fn advance(&mut self) -> Option<u8> {
        if self.processed >= self.total {
            return None;
        }
        self.processed += 1;

        let percent = self.percent();
        if percent % 10 == 0 && percent > self.last_published {
            self.last_published = percent;
            Some(percent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn publish_all(total: usize, steps: usize) -> Vec<u8> {
        let mut tracker = ProgressTracker::new(total);
        (0..steps).filter_map(|_| tracker.advance()).collect()
    }

    #[test]
    fn test_hundred_items_publish_every_decile() {
        assert_eq!(publish_all(100, 100), vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn test_three_items_only_reach_hundred() {
        // 33%, 66%, 100%
        assert_eq!(publish_all(3, 3), vec![100]);
    }

    #[test]
    fn test_empty_tree_publishes_nothing() {
        assert!(publish_all(0, 5).is_empty());
    }

    #[test]
    fn test_extra_advances_are_ignored() {
        let mut tracker = ProgressTracker::new(2);
        tracker.advance();
        assert_eq!(tracker.advance(), Some(100));
        assert_eq!(tracker.advance(), None);
        assert_eq!(tracker.processed(), 2);
        assert_eq!(tracker.percent(), 100);
    }

    proptest! {
        #[test]
        fn prop_events_are_monotonic_deciles(total in 0usize..2000, extra in 0usize..50) {
            let events = publish_all(total, total + extra);

            prop_assert!(events.len() <= 10);
            prop_assert!(events.iter().all(|p| p % 10 == 0 && *p > 0 && *p <= 100));
            prop_assert!(events.windows(2).all(|w| w[0] < w[1]));
            if total > 0 {
                prop_assert_eq!(events.last().copied(), Some(100));
            }
        }
    }
}
