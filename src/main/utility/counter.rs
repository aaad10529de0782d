//! A frequency counter over string keys. The worker uses one pair of these to
//! balance object allocations against deallocations, which is how leak bugs
//! in the listener/waiter machinery show up in simulation summaries.

use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result};

/// Maps individual keys to count values. Unknown keys count as zero.
#[derive(Debug, Default)]
pub struct Counter {
    items: HashMap<String, u64>,
}

impl Counter {
    pub fn new() -> Counter {
        Counter {
            items: HashMap::new(),
        }
    }

    /// Increment the counter value for the key given by id.
    /// Returns the value of the counter after it was incremented.
    pub fn add_one(&mut self, id: &str) -> u64 {
        match self.items.get_mut(id) {
            Some(val) => {
                *val += 1;
                *val
            }
            None => {
                assert_eq!(self.items.insert(id.to_string(), 1), None);
                1
            }
        }
    }

    /// The counter value for the key given by id, or 0 if the key has not
    /// previously been incremented.
    pub fn get_value(&self, id: &str) -> u64 {
        self.items.get(id).copied().unwrap_or(0)
    }
}

impl Display for Counter {
    /// Renders as `{key1:value1, key2:value2, ...}` sorted with the heaviest
    /// hitters first.
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let mut item_vec: Vec<_> = self.items.iter().collect();
        item_vec.sort_by(|&(ka, a), &(kb, b)| b.cmp(a).then_with(|| ka.cmp(kb)));

        write!(f, "{{")?;
        for (i, (key, value)) in item_vec.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}:{value}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut counter = Counter::new();
        assert_eq!(counter.get_value("Process"), 0);
        assert_eq!(counter.add_one("Process"), 1);
        assert_eq!(counter.add_one("Process"), 2);
        assert_eq!(counter.add_one("StatusWaiter"), 1);
        assert_eq!(counter.get_value("Process"), 2);
    }

    #[test]
    fn test_display_sorted() {
        let mut counter = Counter::new();
        counter.add_one("a");
        counter.add_one("b");
        counter.add_one("b");
        assert_eq!(counter.to_string(), "{b:2, a:1}");
    }
}
