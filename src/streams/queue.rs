use std::collections::VecDeque;

/// Ordered chunk buffer that keeps the strategy-computed size of every chunk
/// next to it, so `total_size` always equals the sum of the stored sizes.
pub(crate) struct SizedQueue<T> {
    items: VecDeque<(T, usize)>,
    total_size: usize,
}

impl<T> SizedQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: VecDeque::new(),
            total_size: 0,
        }
    }

    pub(crate) fn push_back(&mut self, chunk: T, size: usize) {
        self.total_size += size;
        self.items.push_back((chunk, size));
    }

    /// Put a partially consumed chunk back at the head.
    pub(crate) fn push_front(&mut self, chunk: T, size: usize) {
        self.total_size += size;
        self.items.push_front((chunk, size));
    }

    pub(crate) fn pop_front(&mut self) -> Option<(T, usize)> {
        let (chunk, size) = self.items.pop_front()?;
        self.total_size -= size;
        Some((chunk, size))
    }

    pub(crate) fn total_size(&self) -> usize {
        self.total_size
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every chunk, returning them in order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + use<T> {
        self.total_size = 0;
        std::mem::take(&mut self.items)
            .into_iter()
            .map(|(chunk, _)| chunk)
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
        self.total_size = 0;
    }
}
