use super::error::{StreamError, StreamResult};
use std::collections::VecDeque;

/// FIFO of values paired with their computed sizes.
///
/// `total_size` is kept in sync with the entries so backpressure checks never
/// walk the queue. Underflow from floating-point drift is clamped at zero.
pub(crate) struct Queue<V> {
    entries: VecDeque<(V, f64)>,
    total_size: f64,
    high_water_mark: f64,
}

impl<V> Queue<V> {
    pub(crate) fn new(high_water_mark: f64) -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0.0,
            high_water_mark,
        }
    }

    /// Appends `value`, rejecting sizes that are negative or infinite.
    ///
    /// A NaN size counts as zero.
    pub(crate) fn enqueue_value_with_size(&mut self, value: V, size: f64) -> StreamResult<()> {
        let size = if size.is_nan() { 0.0 } else { size };
        if size < 0.0 || size.is_infinite() {
            return Err(StreamError::range_error(format!(
                "Chunk size must be a finite, non-negative number (got {})",
                size
            )));
        }
        self.entries.push_back((value, size));
        self.total_size += size;
        Ok(())
    }

    pub(crate) fn dequeue_value(&mut self) -> Option<V> {
        let (value, size) = self.entries.pop_front()?;
        self.total_size = (self.total_size - size).max(0.0);
        Some(value)
    }

    pub(crate) fn peek(&self) -> Option<&V> {
        self.entries.front().map(|(value, _)| value)
    }

    pub(crate) fn peek_mut(&mut self) -> Option<&mut V> {
        self.entries.front_mut().map(|(value, _)| value)
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }

    #[cfg(test)]
    pub(crate) fn total_size(&self) -> f64 {
        self.total_size
    }

    pub(crate) fn desired_size(&self) -> f64 {
        self.high_water_mark - self.total_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Queue<Vec<u8>> {
    /// Moves up to `dst.len()` bytes from the head of the queue into `dst`.
    ///
    /// Partially consumed entries keep their unread tail at the front.
    pub(crate) fn take_bytes(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some((front, size)) = self.entries.front_mut() else {
                break;
            };
            let n = front.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&front[..n]);
            copied += n;
            if n == front.len() {
                self.entries.pop_front();
            } else {
                front.drain(..n);
                *size -= n as f64;
            }
            self.total_size = (self.total_size - n as f64).max(0.0);
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_total_size_through_enqueue_and_dequeue() {
        let mut queue = Queue::new(4.0);
        queue.enqueue_value_with_size("a", 1.5).unwrap();
        queue.enqueue_value_with_size("b", 2.0).unwrap();
        assert_eq!(queue.total_size(), 3.5);
        assert_eq!(queue.desired_size(), 0.5);

        assert_eq!(queue.dequeue_value(), Some("a"));
        assert_eq!(queue.total_size(), 2.0);
        assert_eq!(queue.dequeue_value(), Some("b"));
        assert_eq!(queue.total_size(), 0.0);
        assert_eq!(queue.dequeue_value(), None);
    }

    #[test]
    fn rejects_negative_and_infinite_sizes() {
        let mut queue = Queue::new(1.0);
        assert!(matches!(
            queue.enqueue_value_with_size(1, -1.0),
            Err(StreamError::Range(_))
        ));
        assert!(matches!(
            queue.enqueue_value_with_size(1, f64::INFINITY),
            Err(StreamError::Range(_))
        ));
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn nan_size_counts_as_zero() {
        let mut queue = Queue::new(1.0);
        queue.enqueue_value_with_size(1, f64::NAN).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn total_size_keeps_rounding_residue_after_draining() {
        let mut queue = Queue::new(1.0);
        queue.enqueue_value_with_size(1, 0.1).unwrap();
        queue.enqueue_value_with_size(2, 0.2).unwrap();
        assert_eq!(queue.total_size(), 0.1 + 0.2);
        queue.dequeue_value();
        queue.dequeue_value();
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), (0.1 + 0.2 - 0.1) - 0.2);
        assert!(queue.total_size() > 0.0);
    }

    #[test]
    fn total_size_clamps_at_zero() {
        let mut queue = Queue::new(1.0);
        queue.enqueue_value_with_size(1, 0.3).unwrap();
        queue.enqueue_value_with_size(2, 0.6).unwrap();
        queue.dequeue_value();
        queue.dequeue_value();
        assert_eq!(queue.total_size(), 0.0);
        assert_eq!(queue.desired_size(), 1.0);
    }

    #[test]
    fn reset_empties_queue() {
        let mut queue = Queue::new(2.0);
        queue.enqueue_value_with_size(1, 1.0).unwrap();
        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.desired_size(), 2.0);
    }

    #[test]
    fn take_bytes_splits_entries() {
        let mut queue: Queue<Vec<u8>> = Queue::new(16.0);
        queue.enqueue_value_with_size(vec![1, 2, 3], 3.0).unwrap();
        queue.enqueue_value_with_size(vec![4, 5], 2.0).unwrap();

        let mut dst = [0u8; 4];
        assert_eq!(queue.take_bytes(&mut dst), 4);
        assert_eq!(dst, [1, 2, 3, 4]);
        assert_eq!(queue.total_size(), 1.0);
        assert_eq!(queue.peek(), Some(&vec![5]));

        let mut rest = [0u8; 4];
        assert_eq!(queue.take_bytes(&mut rest), 1);
        assert!(queue.is_empty());
    }
}
