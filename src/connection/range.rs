use std::ops::RangeInclusive;

/// Splits `start..=end` into consecutive ranges of at most `max_block_range` blocks.
#[derive(Debug, Clone)]
pub(crate) struct RangeIterator {
    current: u64,
    end: u64,
    range_size: u64,
    exhausted: bool,
}

impl RangeIterator {
    /// Yields ranges from `start` toward `end`, inclusive. A zero `max_block_range` is treated
    /// as 1.
    pub(crate) fn forward(start: u64, end: u64, max_block_range: u64) -> Self {
        Self { current: start, end, range_size: max_block_range.max(1), exhausted: start > end }
    }
}

impl Iterator for RangeIterator {
    type Item = RangeInclusive<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let batch_start = self.current;
        let batch_end = batch_start.saturating_add(self.range_size - 1).min(self.end);
        if batch_end == self.end {
            self.exhausted = true;
        } else {
            self.current = batch_end + 1;
        }
        Some(batch_start..=batch_end)
    }
}
