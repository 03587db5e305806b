//! Module-usage helper (§4.7.1): how many rooms are currently assigned to
//! each module, kept consistent as rooms move between modules (or drop
//! their assignment) one `set` call at a time.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ModuleUsage {
    counts: HashMap<String, i64>,
    assigns: HashMap<String, String>,
}

impl ModuleUsage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.assigns.clear();
    }

    /// Reassigns `room_id` to `new_id`; pass `""` to clear the assignment.
    /// A no-op if `room_id` is already assigned to `new_id`.
    pub fn set(&mut self, room_id: &str, new_id: &str) {
        let current = self.assigns.get(room_id).map(String::as_str);
        if current == Some(new_id) || (current.is_none() && new_id.is_empty()) {
            return;
        }
        if current.is_some() {
            let old = self.assigns.remove(room_id).expect("checked above");
            self.decrement(&old);
        }
        if !new_id.is_empty() {
            *self.counts.entry(new_id.to_owned()).or_insert(0) += 1;
            self.assigns.insert(room_id.to_owned(), new_id.to_owned());
        }
    }

    fn decrement(&mut self, id: &str) {
        if let Some(count) = self.counts.get_mut(id) {
            *count -= 1;
            if *count <= 0 {
                self.counts.remove(id);
            }
        }
    }

    #[must_use]
    pub fn count(&self, id: &str) -> i64 {
        self.counts.get(id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_assignment_increments_count() {
        let mut usage = ModuleUsage::new();
        usage.set("room-1", "node-a");
        assert_eq!(usage.count("node-a"), 1);
    }

    #[test]
    fn reassignment_moves_count_between_modules() {
        let mut usage = ModuleUsage::new();
        usage.set("room-1", "node-a");
        usage.set("room-1", "node-b");
        assert_eq!(usage.count("node-a"), 0);
        assert_eq!(usage.count("node-b"), 1);
    }

    #[test]
    fn repeated_set_to_same_id_is_noop() {
        let mut usage = ModuleUsage::new();
        usage.set("room-1", "node-a");
        usage.set("room-1", "node-a");
        assert_eq!(usage.count("node-a"), 1);
    }

    #[test]
    fn clearing_assignment_decrements_and_zero_is_evicted() {
        let mut usage = ModuleUsage::new();
        usage.set("room-1", "node-a");
        usage.set("room-1", "");
        assert_eq!(usage.count("node-a"), 0);
    }

    #[test]
    fn unknown_id_counts_zero() {
        let usage = ModuleUsage::new();
        assert_eq!(usage.count("nope"), 0);
    }
}
