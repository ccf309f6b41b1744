use std::collections::VecDeque;

/// Circular buffer that keeps the last `capacity` lines pushed into it
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// oldest to newest
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_before_wrapping() {
        let mut tail = TailBuffer::new(4);
        tail.push("a".into());
        tail.push("b".into());

        assert_eq!(tail.lines().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn overwrites_oldest_in_order() {
        let mut tail = TailBuffer::new(3);
        for line in ["1", "2", "3", "4", "5"] {
            tail.push(line.into());
        }

        assert_eq!(tail.len(), 3);
        assert_eq!(tail.lines().collect::<Vec<_>>(), ["3", "4", "5"]);
    }
}
