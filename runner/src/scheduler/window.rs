use serde::Serialize;
use serde_repr::Serialize_repr;

/// Result of one finished run as seen by the failure breaker
#[derive(Serialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Outcome {
    Success = 0,
    Failure = 1,
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Ring of the last `capacity` run outcomes
#[derive(Debug, Clone)]
pub struct FailureWindow {
    slots: Vec<Outcome>,
    capacity: usize,
    position: usize,
    max_failures: usize,
}

/// Snapshot served on the status endpoint
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct WindowReport {
    /// oldest first
    pub window: Vec<Outcome>,
    pub failures: usize,
    pub capacity: usize,
}

impl FailureWindow {
    /// alarm once `max_failures` of the last `capacity` runs failed
    pub fn new(max_failures: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            position: 0,
            max_failures,
        }
    }

    pub fn push(&mut self, outcome: Outcome) {
        if self.slots.len() < self.capacity {
            self.slots.push(outcome);
        } else {
            self.slots[self.position] = outcome;
        }
        self.position = (self.position + 1) % self.capacity;
    }

    pub fn failures(&self) -> usize {
        self.slots
            .iter()
            .filter(|outcome| **outcome == Outcome::Failure)
            .count()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    /// true when the window is full and holds too many failures
    pub fn alarm(&self) -> bool {
        self.is_full() && self.failures() >= self.max_failures
    }

    pub fn report(&self) -> WindowReport {
        let window = if self.is_full() {
            self.slots[self.position..]
                .iter()
                .chain(&self.slots[..self.position])
                .copied()
                .collect()
        } else {
            self.slots.clone()
        };

        WindowReport {
            window,
            failures: self.failures(),
            capacity: self.capacity,
        }
    }
}
