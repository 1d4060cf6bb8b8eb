use std::collections::VecDeque;

/// Fixed-capacity moving average over the most recent calibrated values.
pub struct RollingWindow {
    buffer: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    evictions_since_resum: usize,
}

impl RollingWindow {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            evictions_since_resum: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// Push a value, evicting the oldest once the window is full.
    pub fn push(&mut self, value: f64) {
        if self.buffer.len() == self.capacity {
            if let Some(old) = self.buffer.pop_front() {
                self.sum -= old;
                self.evictions_since_resum += 1;
            }
        }
        self.buffer.push_back(value);
        self.sum += value;
        // Re-sum once per full turnover to bound drift from the running subtraction.
        if self.evictions_since_resum >= self.capacity {
            self.sum = self.buffer.iter().sum();
            self.evictions_since_resum = 0;
        }
    }

    /// Mean of the last `capacity` values; `None` until that many have been pushed.
    pub fn average(&self) -> Option<f64> {
        if self.is_full() {
            Some(self.sum / self.capacity as f64)
        } else {
            None
        }
    }
}
