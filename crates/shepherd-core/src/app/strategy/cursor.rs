use std::collections::VecDeque;

use crate::domain::QueueMetrics;

/// Walks a prioritized snapshot, handing out each entry a fixed number of times
/// in a row before moving on.
#[derive(Debug, Clone, Default)]
pub struct RepeatCursor {
    pending: VecDeque<(QueueMetrics, u64)>,
    current_item: Option<QueueMetrics>,
    repeats_remaining: u64,
}

impl RepeatCursor {
    /// Every entry is yielded `repeats` times, at least once.
    pub fn new(items: impl IntoIterator<Item = (QueueMetrics, u64)>) -> Self {
        Self {
            pending: items.into_iter().collect(),
            current_item: None,
            repeats_remaining: 0,
        }
    }

    pub fn once_each(items: impl IntoIterator<Item = QueueMetrics>) -> Self {
        Self::new(items.into_iter().map(|item| (item, 1)))
    }

    pub fn is_exhausted(&self) -> bool {
        self.repeats_remaining == 0 && self.pending.is_empty()
    }
}

impl Iterator for RepeatCursor {
    type Item = QueueMetrics;

    fn next(&mut self) -> Option<QueueMetrics> {
        if self.repeats_remaining == 0 {
            let (item, repeats) = self.pending.pop_front()?;
            self.current_item = Some(item);
            self.repeats_remaining = repeats.max(1);
        }
        self.repeats_remaining -= 1;
        self.current_item.clone()
    }
}
