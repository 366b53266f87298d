//! Sliding window for selective-repeat flow control
//!
//! A fixed number of slots addressed by absolute index minus `offset`. Only
//! indices in `[offset, offset + size)` are addressable.

/// Offset-indexed window of optional values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow<T> {
    values: Vec<Option<T>>,
    offset: i64,
}

impl<T> SlidingWindow<T> {
    /// Create an empty window of `size` slots starting at `offset`
    pub fn new(size: usize, offset: i64) -> Self {
        let mut values = Vec::with_capacity(size);
        values.resize_with(size, || None);
        SlidingWindow { values, offset }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// Absolute index of slot 0
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Absolute index of the last slot
    pub fn tail(&self) -> i64 {
        self.offset + self.values.len() as i64 - 1
    }

    /// Store `value` at absolute index `number`
    ///
    /// Indices below the window are ignored; indices past it are logged.
    pub fn set(&mut self, number: i64, value: T) {
        let window_index = number - self.offset;
        if window_index < 0 {
            return;
        }
        match self.values.get_mut(window_index as usize) {
            Some(slot) => *slot = Some(value),
            None => tracing::error!(
                "Window index {} out of bounds (offset {}, size {})",
                number,
                self.offset,
                self.values.len()
            ),
        }
    }

    /// Value at slot `window_index` (relative to offset)
    pub fn get(&self, window_index: usize) -> Option<&T> {
        self.values.get(window_index).and_then(Option::as_ref)
    }

    /// Pop slot 0 if it is filled, shifting the window forward by one
    pub fn advance(&mut self) -> Option<T> {
        if !matches!(self.values.first(), Some(Some(_))) {
            return None;
        }
        let first = self.values.remove(0);
        self.values.push(None);
        self.offset += 1;
        first
    }

    /// Number of filled slots at the start of the window
    pub fn leading_filled(&self) -> usize {
        self.values.iter().take_while(|slot| slot.is_some()).count()
    }

    /// Change the slot count, keeping the leading slots
    pub fn resize(&mut self, size: usize) {
        self.values.resize_with(size, || None);
    }
}
