// ID Provider Port (for deterministic testing)

use std::sync::atomic::{AtomicU64, Ordering};

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    /// Generate a new unique ID (connection ids, listener queue identities)
    fn generate_id(&self) -> String;
}

/// UUID v4 provider (production)
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// `prefix-1`, `prefix-2`, ...
pub struct SequentialIdProvider {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdProvider for SequentialIdProvider {
    fn generate_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdProvider::new("conn");
        assert_eq!(ids.generate_id(), "conn-1");
        assert_eq!(ids.generate_id(), "conn-2");
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        assert_ne!(UuidProvider.generate_id(), UuidProvider.generate_id());
    }
}
