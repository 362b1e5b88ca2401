//! # Category Lock Set
//!
//! In-process mutual exclusion keyed by operation category. Non-durable:
//! the set lives inside the scheduler state and is rebuilt empty on restart
//! (the startup recovery sweep guarantees no task survives as `running`).

use std::collections::HashSet;

use super::registry::OperationCategory;

/// At most one holder per category. Callers pair every successful
/// `try_acquire` with exactly one `release` on every exit path.
#[derive(Debug, Default)]
pub struct CategoryLockSet {
    held: HashSet<OperationCategory>,
}

impl CategoryLockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the category if free. Returning `true` means no other holder
    /// exists until the matching `release`.
    pub fn try_acquire(&mut self, category: OperationCategory) -> bool {
        self.held.insert(category)
    }

    pub fn release(&mut self, category: OperationCategory) {
        self.held.remove(&category);
    }

    pub fn is_held(&self, category: OperationCategory) -> bool {
        self.held.contains(&category)
    }

    pub fn held(&self) -> &HashSet<OperationCategory> {
        &self.held
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let mut locks = CategoryLockSet::new();
        assert!(locks.try_acquire(OperationCategory::NetworkDatalink));
        assert!(locks.is_held(OperationCategory::NetworkDatalink));

        // Second acquire fails until release
        assert!(!locks.try_acquire(OperationCategory::NetworkDatalink));

        locks.release(OperationCategory::NetworkDatalink);
        assert!(!locks.is_held(OperationCategory::NetworkDatalink));
        assert!(locks.try_acquire(OperationCategory::NetworkDatalink));
    }

    #[test]
    fn test_categories_are_independent() {
        let mut locks = CategoryLockSet::new();
        assert!(locks.try_acquire(OperationCategory::PackageManagement));
        assert!(locks.try_acquire(OperationCategory::SystemConfig));
        assert_eq!(locks.len(), 2);

        locks.release(OperationCategory::PackageManagement);
        assert!(!locks.is_held(OperationCategory::PackageManagement));
        assert!(locks.is_held(OperationCategory::SystemConfig));
    }

    #[test]
    fn test_release_of_unheld_is_harmless() {
        let mut locks = CategoryLockSet::new();
        locks.release(OperationCategory::NetworkIp);
        assert!(locks.is_empty());
    }
}
